pub const TUI_REFRESH_HZ: u64 = 4;
pub const TUI_REFRESH_INTERVAL_US: u64 = 1_000_000 / TUI_REFRESH_HZ;
