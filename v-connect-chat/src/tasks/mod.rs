pub mod coord_sweep;
pub mod heartbeat;
