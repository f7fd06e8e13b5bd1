//! Declarative policy gates, checked before any action mutates state.

use fraudesk_contracts::OTP_KYC_LEVEL;

/// Fixed demo verification value; no real OTP provider is integrated.
pub(super) const DEMO_OTP: &str = "123456";

/// Higher-trust customers authenticate destructive actions with an OTP.
pub(super) fn freeze_requires_otp(kyc_level: i16) -> bool {
    kyc_level >= OTP_KYC_LEVEL
}

pub(super) fn verify_otp(supplied: &str) -> bool {
    supplied == DEMO_OTP
}
