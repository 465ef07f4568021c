pub const SUCCESS: i32 = 0;
/// Bad arguments or configuration
pub const INPUT_ERROR: i32 = 1;
/// Pipeline or output failure after a successful start
pub const EXECUTION_ERROR: i32 = 2;
/// Capture device could not be opened
pub const HARDWARE_UNAVAILABLE: i32 = 3;
