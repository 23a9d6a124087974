//! Process-wide monitor knobs.
//!
//! Flags can be set programmatically (`set_monitorflags_spin_limit(..)`) or
//! parsed from the command line and environment with [`parse`]:
//! `--spin-limit=100`, `--no-use-object-monitor-table`, `OBJMON_PRE_SPIN=20`.

use crate::{
    define_flag,
    utils::flags::{self, FlagError},
};

pub struct MonitorFlags;

define_flag!(MonitorFlags =>
    usize,
    spin_limit,
    5000,
    "Upper bound of the adaptive spin duration, also the initial duration of a new monitor. (default: 5000)"
);
define_flag!(MonitorFlags =>
    usize,
    fixed_spin,
    0,
    "When non-zero, spin exactly this many iterations instead of adapting. (default: 0)"
);
define_flag!(MonitorFlags =>
    usize,
    pre_spin,
    10,
    "Short fixed spin performed before the adaptive phase. (default: 10)"
);
define_flag!(MonitorFlags =>
    usize,
    spin_bonus,
    100,
    "Amount the spin duration grows by after a successful spin. (default: 100)"
);
define_flag!(MonitorFlags =>
    usize,
    spin_penalty,
    200,
    "Amount the spin duration shrinks by after a failed spin. (default: 200)"
);
define_flag!(MonitorFlags =>
    usize,
    spin_poverty,
    1000,
    "Floor the spin duration is raised to before a bonus is applied. (default: 1000)"
);
define_flag!(MonitorFlags =>
    usize,
    max_recheck_interval,
    1000,
    "Cap in milliseconds of the timed park used by the responsible thread. (default: 1000)"
);
define_flag!(MonitorFlags =>
    bool,
    use_object_monitor_table,
    false,
    "Monitors are found through a side table and cache the identity hash. (default: false)"
);

/// Environment prefix used by [`parse_env_and_args`].
pub const ENV_PREFIX: &str = "OBJMON";

/// Parse monitor flags from the process arguments and environment.
pub fn parse_env_and_args() -> Result<(), FlagError> {
    parse(std::env::args(), std::env::vars())
}

pub fn parse(
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    // Command-line flags are unprefixed, environment variables are `OBJMON_*`.
    let env = env.filter_map(|(key, value)| {
        key.strip_prefix(ENV_PREFIX)
            .and_then(|rest| rest.strip_prefix('_'))
            .map(|name| (name.to_owned(), value))
    });
    flags::parse::<MonitorFlags>(args, env)
}

/// Snapshot of the spin knobs, taken once per spin attempt so that a
/// concurrent flag update never mixes two configurations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpinKnobs {
    pub limit: isize,
    pub fixed: isize,
    pub pre_spin: isize,
    pub bonus: isize,
    pub penalty: isize,
    pub poverty: isize,
}

impl SpinKnobs {
    pub fn current() -> Self {
        let clamp = |v: usize| v.min(isize::MAX as usize) as isize;
        Self {
            limit: clamp(monitorflags_spin_limit()),
            fixed: clamp(monitorflags_fixed_spin()),
            pre_spin: clamp(monitorflags_pre_spin()),
            bonus: clamp(monitorflags_spin_bonus()),
            penalty: clamp(monitorflags_spin_penalty()),
            poverty: clamp(monitorflags_spin_poverty()),
        }
    }

    /// Grow a spin duration after a successful spin.
    pub fn adjust_up(&self, duration: isize) -> isize {
        let mut x = duration;
        if x < self.limit {
            if x < self.poverty {
                x = self.poverty;
            }
            x += self.bonus;
        }
        x
    }

    /// Shrink a spin duration after a failed spin.
    pub fn adjust_down(&self, duration: isize) -> isize {
        let mut x = duration;
        if x > 0 {
            x -= self.penalty;
            if x < 0 {
                x = 0;
            }
        }
        x
    }
}

impl Default for SpinKnobs {
    fn default() -> Self {
        Self {
            limit: 5000,
            fixed: 0,
            pre_spin: 10,
            bonus: 100,
            penalty: 200,
            poverty: 1000,
        }
    }
}

/// What the metadata word of a monitor holds. Decided once per monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetadataKind {
    /// The displaced header word of the locked object.
    Header,
    /// A cached identity hash; the object is found through a side table.
    Hash,
}

impl MetadataKind {
    pub fn current() -> Self {
        if monitorflags_use_object_monitor_table() {
            Self::Hash
        } else {
            Self::Header
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_spin_duration() {
        let knobs = SpinKnobs::default();

        // a cold monitor is first lifted to the poverty line
        assert_eq!(knobs.adjust_up(0), 1100);
        assert_eq!(knobs.adjust_up(1100), 1200);
        // saturated
        assert_eq!(knobs.adjust_up(5000), 5000);
        assert_eq!(knobs.adjust_up(6000), 6000);

        assert_eq!(knobs.adjust_down(1000), 800);
        assert_eq!(knobs.adjust_down(150), 0);
        assert_eq!(knobs.adjust_down(0), 0);
    }

    #[test]
    fn defaults_are_registered() {
        let names = flags::FlagsOf::<MonitorFlags>::names();
        for name in [
            "spin_limit",
            "fixed_spin",
            "pre_spin",
            "spin_bonus",
            "spin_penalty",
            "spin_poverty",
            "max_recheck_interval",
            "use_object_monitor_table",
        ] {
            assert!(names.contains(&name), "{name} is not registered");
        }
        assert!(flags::FlagsOf::<MonitorFlags>::help().contains("--spin-limit"));
    }
}
