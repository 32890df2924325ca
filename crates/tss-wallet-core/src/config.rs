//! Engine configuration

use crate::paillier::MIN_MODULUS_BITS;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for sessions, protocol engines and background workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TssConfig {
    /// Overall deadline of one keygen or signing session, in seconds
    pub session_timeout_secs: u64,
    /// Bound on a single protocol round, in seconds
    pub round_timeout_secs: u64,
    /// Bound on Paillier pre-parameter generation, in seconds
    pub preparams_timeout_secs: u64,
    /// Age after which a session is swept regardless of state, in seconds
    pub session_max_age_secs: u64,
    /// Interval between session sweeps, in seconds
    pub sweep_interval_secs: u64,
    /// Paillier modulus size in bits
    pub paillier_bits: u64,
    /// Capacity of each party's inbox
    pub channel_capacity: usize,
    /// Interval between rotation checks, in seconds
    pub rotation_check_interval_secs: u64,
}

impl Default for TssConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 300,
            round_timeout_secs: 60,
            preparams_timeout_secs: 120,
            session_max_age_secs: 300,
            sweep_interval_secs: 600,
            paillier_bits: 2048,
            channel_capacity: 64,
            rotation_check_interval_secs: 3600,
        }
    }
}

impl TssConfig {
    /// Set the overall session timeout
    pub fn with_session_timeout(mut self, secs: u64) -> Self {
        self.session_timeout_secs = secs;
        self
    }

    /// Set the per-round timeout
    pub fn with_round_timeout(mut self, secs: u64) -> Self {
        self.round_timeout_secs = secs;
        self
    }

    /// Set the pre-parameter timeout
    pub fn with_preparams_timeout(mut self, secs: u64) -> Self {
        self.preparams_timeout_secs = secs;
        self
    }

    /// Set the sweep age bound and interval
    pub fn with_sweep(mut self, max_age_secs: u64, interval_secs: u64) -> Self {
        self.session_max_age_secs = max_age_secs;
        self.sweep_interval_secs = interval_secs;
        self
    }

    /// Set the Paillier modulus size
    pub fn with_paillier_bits(mut self, bits: u64) -> Self {
        self.paillier_bits = bits;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_rotation_check_interval(mut self, secs: u64) -> Self {
        self.rotation_check_interval_secs = secs;
        self
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout_secs)
    }

    pub fn preparams_timeout(&self) -> Duration {
        Duration::from_secs(self.preparams_timeout_secs)
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn rotation_check_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_check_interval_secs)
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("session_timeout_secs", self.session_timeout_secs),
            ("round_timeout_secs", self.round_timeout_secs),
            ("preparams_timeout_secs", self.preparams_timeout_secs),
            ("session_max_age_secs", self.session_max_age_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("rotation_check_interval_secs", self.rotation_check_interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if self.round_timeout_secs > self.session_timeout_secs {
            return Err(Error::InvalidConfig(
                "round timeout exceeds the session timeout".into(),
            ));
        }
        if self.paillier_bits < MIN_MODULUS_BITS || self.paillier_bits % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "paillier_bits must be an even number >= {}",
                MIN_MODULUS_BITS
            )));
        }
        if self.channel_capacity == 0 {
            return Err(Error::InvalidConfig("channel_capacity must be positive".into()));
        }
        Ok(())
    }
}
