pub mod preview_sweep;
