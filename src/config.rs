use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::geometry::Real;




/**
 * What to do with a coupled body whose bound intersects no external
 * partition at all.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LostParticlePolicy {
    /// Report it as lost right away.
    ReportUnintersected,
    /// Assume it briefly left the coupled region and say nothing.
    IgnoreUnintersected,
}




/**
 * Settings of the external fluid coupling.
 */
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CouplingConfig {
    /// Exchange with the external solver every this many iterations.
    pub data_exchange_interval: u64,
    pub parallel_mode: bool,
    /// Serial mode: forces are summed over all external ranks instead of
    /// received from the owning rank.
    pub gaussian_interp: bool,
    /// World rank of the first external process.
    pub fluid_rank_offset: usize,
    pub num_fluid_ranks: usize,
    pub lost_particle_policy: LostParticlePolicy,
    /// Local rank that talks to the external master.
    pub yade_master: usize,
}




/**
 * Top-level configuration of a rank.
 */
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub num_threads: usize,
    pub pin_threads: bool,
    /// Margin added to a subdomain's box (the Verlet distance of the
    /// partition).
    pub extra_length: Real,
    pub verlet_dist: Real,
    pub serialize_sorted: bool,
    /// Receive timeout in milliseconds. `None` blocks forever, which is the
    /// contract of the synchronous step.
    pub recv_timeout_ms: Option<u64>,
    /// Migrate bodies and rebuild the partition every this many steps.
    pub migration_interval: u64,
    pub coupling: CouplingConfig,
}




// ============================================================================
impl Config {
    pub fn recv_timeout(&self) -> Option<Duration> {
        self.recv_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for CouplingConfig {
    fn default() -> Self {
        Self {
            data_exchange_interval: 1,
            parallel_mode: true,
            gaussian_interp: false,
            fluid_rank_offset: 0,
            num_fluid_ranks: 0,
            lost_particle_policy: LostParticlePolicy::ReportUnintersected,
            yade_master: 0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_threads: 1,
            pin_threads: false,
            extra_length: 0.0,
            verlet_dist: 0.0,
            serialize_sorted: false,
            recv_timeout_ms: None,
            migration_interval: 100,
            coupling: CouplingConfig::default(),
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{Config, LostParticlePolicy};

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let mut bytes = Vec::new();
        let partial = ciborium::value::Value::Map(vec![(
            ciborium::value::Value::Text("num_threads".into()),
            ciborium::value::Value::Integer(4.into()),
        )]);
        ciborium::ser::into_writer(&partial, &mut bytes).unwrap();

        let config: Config = ciborium::de::from_reader(&bytes[..]).unwrap();
        assert_eq!(config.num_threads, 4);
        assert_eq!(config.recv_timeout(), None);
        assert_eq!(config.coupling.data_exchange_interval, 1);
        assert_eq!(
            config.coupling.lost_particle_policy,
            LostParticlePolicy::ReportUnintersected
        );
    }
}
