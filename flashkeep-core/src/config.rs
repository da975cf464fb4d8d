//! Capacity limits and key range

/// Default number of persisters a coordinator can register
pub const MAX_PERSISTERS: usize = 16;

/// Default number of observers a coordinator can notify
pub const MAX_OBSERVERS: usize = 4;

/// First key handed out at registration
pub const FIRST_RECORD_KEY: u16 = 0x0001;

/// Last key that can be handed out; keys are never reused
pub const LAST_RECORD_KEY: u16 = 0xBFFF;
