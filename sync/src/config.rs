//! Synchronization tunables and their command-line surface.

use clap::Parser;

/// Tunables of the synchronization core.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncConfig {
    /// Network tick length in seconds. Clamped to at least 10 ms.
    pub update_period: f32,
    /// Priority recompute / observer send period in seconds. Clamped to at
    /// least `update_period`.
    pub priority_update_period: f32,
    /// Enables the default distance-based prioritizer.
    pub interest_management: bool,
    /// Suppresses the hand-off to local physics after the extrapolation
    /// window.
    pub no_client_physics: bool,
    /// Extrapolation window beyond the initial interpolation interval, in
    /// milliseconds. The first update period is always interpolation; this
    /// extends it.
    pub client_extrapolation_time_ms: Option<f32>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            update_period: 1.0 / 20.0,
            priority_update_period: 1.0,
            interest_management: false,
            no_client_physics: false,
            client_extrapolation_time_ms: None,
        }
    }
}

impl SyncConfig {
    /// The extrapolation horizon in multiples of the update period. The
    /// window `[1, horizon)` is linear extrapolation; past it the rigid body
    /// is handed to local physics.
    pub fn max_lin_extrap_time(&self) -> f32 {
        match self.client_extrapolation_time_ms {
            Some(ms) if ms >= 0.0 => 1.0 + ms / 1000.0 / self.update_period,
            _ => 1.0,
        }
    }

    pub fn clamped(mut self) -> Self {
        if self.update_period < 0.01 {
            self.update_period = 0.01;
        }
        if self.priority_update_period < self.update_period {
            self.priority_update_period = self.update_period;
        }
        self
    }
}

/// Command-line arguments consumed by the synchronization core.
///
/// Flag values override a [`SyncConfig`] built elsewhere.
#[derive(Parser, Debug)]
#[command(name = "undine", about = "Scene synchronization options")]
pub struct SyncArgs {
    /// Enable interest-management prioritization.
    #[arg(long)]
    pub interest_management: Option<bool>,

    /// Do not hand extrapolating rigid bodies to local physics.
    #[arg(long)]
    pub no_client_physics: bool,

    /// Client-side extrapolation window in milliseconds.
    #[arg(long)]
    pub client_extrapolation_time: Option<f32>,
}

impl SyncConfig {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &SyncArgs) {
        if let Some(im) = args.interest_management {
            self.interest_management = im;
        }
        if args.no_client_physics {
            self.no_client_physics = true;
        }
        if let Some(ms) = args.client_extrapolation_time {
            self.client_extrapolation_time_ms = Some(ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extrapolation_window_converts_to_period_multiples() {
        let mut config = SyncConfig::default();
        assert_eq!(config.max_lin_extrap_time(), 1.0);
        config.client_extrapolation_time_ms = Some(100.0);
        // 100 ms on a 50 ms period is two extra periods.
        assert!((config.max_lin_extrap_time() - 3.0).abs() < 1e-6);
    }

    #[test]
    fn clamping_keeps_priority_period_above_update_period() {
        let config = SyncConfig {
            update_period: 0.001,
            priority_update_period: 0.005,
            ..SyncConfig::default()
        }
        .clamped();
        assert_eq!(config.update_period, 0.01);
        assert_eq!(config.priority_update_period, 0.01);
    }

    #[test]
    fn cli_overrides() {
        let args = SyncArgs::parse_from([
            "undine",
            "--interest-management",
            "true",
            "--no-client-physics",
            "--client-extrapolation-time",
            "250",
        ]);
        let mut config = SyncConfig::default();
        config.apply_cli_overrides(&args);
        assert!(config.interest_management);
        assert!(config.no_client_physics);
        assert_eq!(config.client_extrapolation_time_ms, Some(250.0));
    }

    #[test]
    fn cli_defaults_leave_config_untouched() {
        let args = SyncArgs::parse_from(["undine"]);
        let mut config = SyncConfig::default();
        config.apply_cli_overrides(&args);
        assert_eq!(config, SyncConfig::default());
    }
}
