//! Run-time options, read from environment variables at instance creation.

use std::str::FromStr;

use log::LevelFilter;
use strum_macros::EnumString;

/// Which rendezvous protocol the instance uses to stop mutators for collection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum RendezvousSelector {
    /// Mutators poll a yield flag at safe points.
    Cooperative,
    /// Mutators are interrupted by a process signal.
    Uncooperative,
}

/// Options for an MRTK instance.
///
/// Each option can be overridden from an environment variable named `MRTK_` followed by the
/// upper-case field name, e.g. `MRTK_RENDEZVOUS=uncooperative`.
#[derive(Clone, Debug)]
pub struct Options {
    /// The rendezvous protocol. Hosted VMs with compiler-inserted safe-point polls should use
    /// the cooperative variant; VMs running code without polls need the uncooperative one.
    pub rendezvous: RendezvousSelector,
    /// Whether `initialize_collection` spawns the finalizer thread.
    pub finalizer_thread: bool,
    /// Base level for the built-in logger (see `crate::util::logger`). `RUST_LOG` refines
    /// this per module.
    pub log_level: LevelFilter,
}

impl Options {
    /// Built-in defaults, without reading environment variables.
    pub fn default_values() -> Self {
        Options {
            rendezvous: RendezvousSelector::Cooperative,
            finalizer_thread: true,
            log_level: LevelFilter::Info,
        }
    }

    /// Read environment variable settings and override the current values.
    pub fn read_env_var_settings(&mut self) {
        if let Some(val) = env_setting("MRTK_RENDEZVOUS") {
            match RendezvousSelector::from_str(&val) {
                Ok(selector) => self.rendezvous = selector,
                Err(_) => warn!("Invalid MRTK_RENDEZVOUS value: {}", val),
            }
        }
        if let Some(val) = env_setting("MRTK_FINALIZER_THREAD") {
            match val.parse::<bool>() {
                Ok(enabled) => self.finalizer_thread = enabled,
                Err(_) => warn!("Invalid MRTK_FINALIZER_THREAD value: {}", val),
            }
        }
        if let Some(val) = env_setting("MRTK_LOG_LEVEL") {
            match val.parse::<LevelFilter>() {
                Ok(level) => self.log_level = level,
                Err(_) => warn!("Invalid MRTK_LOG_LEVEL value: {}", val),
            }
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        let mut options = Self::default_values();
        options.read_env_var_settings();
        options
    }
}

fn env_setting(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rendezvous_selector() {
        assert_eq!(
            RendezvousSelector::from_str("cooperative").unwrap(),
            RendezvousSelector::Cooperative
        );
        assert_eq!(
            RendezvousSelector::from_str("uncooperative").unwrap(),
            RendezvousSelector::Uncooperative
        );
        assert!(RendezvousSelector::from_str("signal").is_err());
    }

    #[test]
    fn defaults() {
        let options = Options::default_values();
        assert_eq!(options.rendezvous, RendezvousSelector::Cooperative);
        assert!(options.finalizer_thread);
        assert_eq!(options.log_level, LevelFilter::Info);
    }
}
