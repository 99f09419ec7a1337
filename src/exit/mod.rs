// =============================================================================
// Exit Management Module
// =============================================================================
//
// `monitor` is the background loop that reconciles every open trade's
// protective legs against the venue's open orders and closes out fills it
// detects.

pub mod monitor;
