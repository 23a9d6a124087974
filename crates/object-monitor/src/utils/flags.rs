//! A small library to parse command-line and environmental flags.
//!
//! Flags are grouped by a marker type (`MonitorFlags`, ...) and declared with
//! [`define_flag!`](crate::define_flag). Every flag registers itself before
//! `main` runs, so a group can be parsed as soon as the program starts:
//!
//! ```ignore
//! pub struct MyFlags;
//! define_flag!(MyFlags => usize, spin_limit, 5000, "Maximum spin duration");
//!
//! utils::flags::parse::<MyFlags>(std::env::args(), std::env::vars())?;
//! assert_eq!(myflags_spin_limit(), 5000);
//! ```

use std::{
    any::TypeId,
    fmt::{self, Write},
    marker::PhantomData,
    sync::atomic::{AtomicBool, Ordering},
};

use atomic::Atomic;
use parking_lot::Mutex;

/// A value that can be stored in a flag.
pub trait FlagValue: Copy + bytemuck::NoUninit + fmt::Display + Send + Sync + 'static {
    const TYPE_NAME: &'static str;

    fn parse_flag(argument: &str) -> Option<Self>;

    /// Value of `--name` / `--no-name` given without an `=argument`.
    fn implicit(negated: bool) -> Option<Self> {
        let _ = negated;
        None
    }
}

impl FlagValue for bool {
    const TYPE_NAME: &'static str = "bool";

    fn parse_flag(argument: &str) -> Option<Self> {
        match argument {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    fn implicit(negated: bool) -> Option<Self> {
        Some(!negated)
    }
}

/// Split off a `0x` (hex) or leading `0` (octal) prefix.
fn radix_of(argument: &str) -> (&str, u32) {
    if argument.len() > 2 && &argument[0..2] == "0x" {
        (&argument[2..], 16)
    } else if argument.len() > 1 && &argument[0..1] == "0" {
        (&argument[1..], 8)
    } else {
        (argument, 10)
    }
}

impl FlagValue for usize {
    const TYPE_NAME: &'static str = "usize";

    fn parse_flag(argument: &str) -> Option<Self> {
        let (digits, radix) = radix_of(argument);
        usize::from_str_radix(digits, radix).ok()
    }
}

impl FlagValue for isize {
    const TYPE_NAME: &'static str = "isize";

    fn parse_flag(argument: &str) -> Option<Self> {
        let (negative, magnitude) = match argument.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, argument),
        };
        let (digits, radix) = radix_of(magnitude);
        let value = isize::from_str_radix(digits, radix).ok()?;
        Some(if negative { -value } else { value })
    }
}

pub struct Flag<T: FlagValue> {
    name: &'static str,
    comment: &'static str,
    default: T,
    value: Atomic<T>,
    is_set: AtomicBool,
}

impl<T: FlagValue> Flag<T> {
    pub const fn new(name: &'static str, default: T, comment: &'static str) -> Self {
        Self {
            name,
            comment,
            default,
            value: Atomic::new(default),
            is_set: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> T {
        self.value.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: T) {
        self.value.store(value, Ordering::Relaxed);
        self.is_set.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.is_set.load(Ordering::Relaxed)
    }

    /// Restore the default value and forget that the flag was set.
    pub fn reset(&self) {
        self.value.store(self.default, Ordering::Relaxed);
        self.is_set.store(false, Ordering::Relaxed);
    }
}

trait AnyFlag: Sync {
    fn name(&self) -> &'static str;
    fn is_set(&self) -> bool;
    fn set_from_str(&self, argument: &str) -> bool;
    fn set_implicit(&self, negated: bool) -> bool;
    fn describe(&self, out: &mut String);
}

impl<T: FlagValue> AnyFlag for Flag<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn is_set(&self) -> bool {
        Flag::is_set(self)
    }

    fn set_from_str(&self, argument: &str) -> bool {
        match T::parse_flag(argument) {
            Some(value) => {
                self.set(value);
                true
            }
            None => false,
        }
    }

    fn set_implicit(&self, negated: bool) -> bool {
        match T::implicit(negated) {
            Some(value) => {
                self.set(value);
                true
            }
            None => false,
        }
    }

    fn describe(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "  --{:<32} {} (type: {}, default: {})",
            self.name.replace('_', "-"),
            self.comment,
            T::TYPE_NAME,
            self.default
        );
    }
}

struct FlagGroup {
    type_id: TypeId,
    flags: Vec<&'static dyn AnyFlag>,
    initialized: bool,
}

/// A map of group type-id -> flags. Filled by `#[ctor]` functions before main.
static FLAGS: Mutex<Vec<FlagGroup>> = Mutex::new(Vec::new());

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlagError {
    #[error("unknown flag `{0}`")]
    FlagNotFound(String),
    #[error("flags of `{0}` were already initialized")]
    FlagsAlreadyInitialized(&'static str),
    #[error("no flags registered for `{0}`")]
    NoFlags(&'static str),
    #[error("`{argument}` is an invalid value for flag `{name}`")]
    InvalidValue { name: String, argument: String },
}

/// Registers a flag in group `G`.
#[doc(hidden)]
pub fn register_flag<G: 'static, T: FlagValue>(flag: &'static Flag<T>) {
    let mut groups = FLAGS.lock();
    let type_id = TypeId::of::<G>();

    let ix = match groups.iter().position(|group| group.type_id == type_id) {
        Some(ix) => ix,
        None => {
            groups.push(FlagGroup {
                type_id,
                flags: Vec::new(),
                initialized: false,
            });
            groups.len() - 1
        }
    };
    let group = &mut groups[ix];

    if !group.flags.iter().any(|f| f.name() == flag.name) {
        group.flags.push(flag);
    }
}

pub struct FlagsOf<G>(PhantomData<G>);

impl<G: 'static> FlagsOf<G> {
    fn with_group<T>(f: impl FnOnce(&mut FlagGroup) -> T) -> Option<T> {
        let mut groups = FLAGS.lock();
        let type_id = TypeId::of::<G>();
        groups
            .iter_mut()
            .find(|group| group.type_id == type_id)
            .map(f)
    }

    fn lookup(name: &str) -> Option<&'static dyn AnyFlag> {
        Self::with_group(|group| group.flags.iter().copied().find(|f| f.name() == name)).flatten()
    }

    pub fn is_set(name: &str) -> bool {
        Self::lookup(name).map_or(false, |flag| flag.is_set())
    }

    pub fn names() -> Vec<&'static str> {
        Self::with_group(|group| group.flags.iter().map(|f| f.name()).collect())
            .unwrap_or_default()
    }

    /// Human readable listing of every flag in the group.
    pub fn help() -> String {
        let mut out = String::new();
        Self::with_group(|group| {
            let mut flags = group.flags.clone();
            flags.sort_by_key(|f| f.name());
            for flag in flags {
                flag.describe(&mut out);
            }
        });
        out
    }

    fn parse_option(option: &str) -> Result<(), FlagError> {
        let (name, argument) = match option.find('=') {
            Some(pos) => (&option[..pos], Some(&option[pos + 1..])),
            None => (option, None),
        };
        let name = name.replace('-', "_");

        let (flag, negated) = match Self::lookup(&name) {
            Some(flag) => (flag, false),
            None => match name.strip_prefix("no_").filter(|_| argument.is_none()) {
                Some(positive) => match Self::lookup(positive) {
                    Some(flag) => (flag, true),
                    None => return Err(FlagError::FlagNotFound(name)),
                },
                None => return Err(FlagError::FlagNotFound(name)),
            },
        };

        let accepted = match argument {
            Some(argument) => flag.set_from_str(argument),
            None => flag.set_implicit(negated),
        };

        if accepted {
            Ok(())
        } else {
            Err(FlagError::InvalidValue {
                name,
                argument: argument.unwrap_or_default().to_owned(),
            })
        }
    }

    fn process_command_line_flags(
        prefix: Option<&str>,
        args: impl Iterator<Item = String>,
    ) -> Result<(), FlagError> {
        let cli_prefix = prefix
            .map(|prefix| format!("--{}:", prefix))
            .unwrap_or_else(|| "--".to_owned());

        for arg in args {
            if let Some(option) = arg.strip_prefix(cli_prefix.as_str()) {
                if !option.is_empty() {
                    Self::parse_option(option)?;
                }
            }
        }

        Ok(())
    }

    fn process_environmental_vars(
        prefix: Option<&str>,
        vars: impl Iterator<Item = (String, String)>,
    ) -> Result<(), FlagError> {
        let env_prefix = prefix
            .map(|prefix| format!("{}_", prefix.to_uppercase()))
            .unwrap_or_default();

        for (key, argument) in vars {
            let Some(name) = key.strip_prefix(env_prefix.as_str()) else {
                continue;
            };
            let name = name.to_lowercase();
            // Unrelated environment variables are expected here.
            if let Some(flag) = Self::lookup(&name) {
                if !flag.set_from_str(&argument) {
                    return Err(FlagError::InvalidValue { name, argument });
                }
            }
        }

        Ok(())
    }

    fn begin_parse() -> Result<(), FlagError> {
        match Self::with_group(|group| std::mem::replace(&mut group.initialized, true)) {
            None => Err(FlagError::NoFlags(std::any::type_name::<G>())),
            Some(true) => Err(FlagError::FlagsAlreadyInitialized(
                std::any::type_name::<G>(),
            )),
            Some(false) => Ok(()),
        }
    }
}

/// Parse flags of group `G`. Environment variables are applied first so that
/// command-line flags take precedence.
pub fn parse<G: 'static>(
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    FlagsOf::<G>::begin_parse()?;
    FlagsOf::<G>::process_environmental_vars(None, env)?;
    FlagsOf::<G>::process_command_line_flags(None, args)
}

/// Like [`parse`], but command-line flags are spelled `--prefix:name` and
/// environment variables `PREFIX_NAME`.
pub fn parse_with_prefix<G: 'static>(
    prefix: &str,
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    FlagsOf::<G>::begin_parse()?;
    FlagsOf::<G>::process_environmental_vars(Some(prefix), env)?;
    FlagsOf::<G>::process_command_line_flags(Some(prefix), args)
}

#[doc(hidden)]
pub use ctor::ctor;
#[doc(hidden)]
pub use paste;

#[macro_export]
macro_rules! define_flag {
    ($of: ident => $typ: ty, $name: ident, $default_value: expr, $comment: literal) => {
        $crate::utils::flags::paste::paste! {
            static [<$of:upper _FLAG_ $name:upper>]: $crate::utils::flags::Flag<$typ> =
                $crate::utils::flags::Flag::new(stringify!($name), $default_value, $comment);

            #[doc(hidden)]
            #[$crate::utils::flags::ctor]
            fn [<init_ $of:lower _ $name _flag>]() {
                $crate::utils::flags::register_flag::<$of, $typ>(&[<$of:upper _FLAG_ $name:upper>]);
            }

            #[doc = $comment]
            pub fn [<$of:lower _ $name>]() -> $typ {
                [<$of:upper _FLAG_ $name:upper>].get()
            }

            pub fn [<set_ $of:lower _ $name>](value: $typ) {
                [<$of:upper _FLAG_ $name:upper>].set(value)
            }

            pub fn [<reset_ $of:lower _ $name>]() {
                [<$of:upper _FLAG_ $name:upper>].reset()
            }

            pub fn [<is_ $of:lower _ $name _set>]() -> bool {
                [<$of:upper _FLAG_ $name:upper>].is_set()
            }
        }
    };
}
