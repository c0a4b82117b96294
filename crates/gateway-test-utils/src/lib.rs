//! Test-only helpers for driving a `Gateway` over a real TCP socket.

mod mock_device;

pub use mock_device::MockDevice;

/// A plausible 20-character ICCID starting with the required "89" prefix,
/// for tests that don't care about a specific carrier/operator code.
#[must_use]
pub fn sample_iccid() -> String {
    "89860012345678901234".to_string()
}
