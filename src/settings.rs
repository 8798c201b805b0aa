//! Per-request parameter source.
//!
//! The session reads sampling and load parameters from a [`SettingsProvider`]
//! each time it starts a load or a chat turn, so changes take effect on the
//! next request without restarting anything.

use std::sync::RwLock;

use crate::backend::LoadParams;
use crate::config::Config;
use crate::error::SessionError;
use crate::session::SamplingParams;

pub trait SettingsProvider: Send + Sync {
    fn sampling(&self) -> SamplingParams;
    fn load_params(&self) -> LoadParams;
    fn system_prompt(&self) -> String;
    fn speech_enabled(&self) -> bool;
}

/// Static settings straight from the config file.
impl SettingsProvider for Config {
    fn sampling(&self) -> SamplingParams {
        self.sampling
    }

    fn load_params(&self) -> LoadParams {
        self.model.load_params()
    }

    fn system_prompt(&self) -> String {
        self.chat.system_prompt.clone()
    }

    fn speech_enabled(&self) -> bool {
        self.speech.enabled
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    sampling: SamplingParams,
    load: LoadParams,
    system_prompt: String,
    speech_enabled: bool,
}

/// Settings that can be edited while the session runs.
#[derive(Debug)]
pub struct LiveSettings {
    inner: RwLock<Snapshot>,
}

impl LiveSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            inner: RwLock::new(Snapshot {
                sampling: config.sampling,
                load: config.model.load_params(),
                system_prompt: config.chat.system_prompt.clone(),
                speech_enabled: config.speech.enabled,
            }),
        }
    }

    fn read(&self) -> Snapshot {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn write(&self, f: impl FnOnce(&mut Snapshot)) {
        f(&mut self.inner.write().unwrap_or_else(|p| p.into_inner()));
    }

    /// Replace the sampling parameters.  Out-of-range values are rejected and
    /// the previous values stay in effect.
    pub fn set_sampling(&self, sampling: SamplingParams) -> Result<(), SessionError> {
        sampling.validate()?;
        self.write(|s| s.sampling = sampling);
        Ok(())
    }

    /// Applies to the next model load.
    pub fn set_load_params(&self, load: LoadParams) {
        self.write(|s| s.load = load);
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        self.write(|s| s.system_prompt = prompt);
    }

    pub fn set_speech_enabled(&self, enabled: bool) {
        self.write(|s| s.speech_enabled = enabled);
    }
}

impl SettingsProvider for LiveSettings {
    fn sampling(&self) -> SamplingParams {
        self.read().sampling
    }

    fn load_params(&self) -> LoadParams {
        self.read().load
    }

    fn system_prompt(&self) -> String {
        self.read().system_prompt
    }

    fn speech_enabled(&self) -> bool {
        self.read().speech_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn config_is_a_static_provider() {
        let cfg = Config::test_default(Path::new("/tmp"));
        assert_eq!(cfg.sampling(), SamplingParams::default());
        assert_eq!(cfg.load_params().context_size, 2048);
        assert!(!cfg.speech_enabled());
    }

    #[test]
    fn live_settings_apply_valid_changes() {
        let live = LiveSettings::from_config(&Config::test_default(Path::new("/tmp")));
        let hot = SamplingParams { temperature: 1.3, ..SamplingParams::default() };
        live.set_sampling(hot).unwrap();
        live.set_system_prompt("Be brief.");
        live.set_speech_enabled(true);
        assert_eq!(live.sampling().temperature, 1.3);
        assert_eq!(live.system_prompt(), "Be brief.");
        assert!(live.speech_enabled());
    }

    #[test]
    fn live_settings_reject_out_of_range() {
        let live = LiveSettings::from_config(&Config::test_default(Path::new("/tmp")));
        let bad = SamplingParams { top_p: 0.0, ..SamplingParams::default() };
        assert!(live.set_sampling(bad).is_err());
        assert_eq!(live.sampling(), SamplingParams::default());
    }
}
