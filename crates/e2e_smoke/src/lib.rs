//! End-to-end smoke coverage lives in `tests/smoke.rs`, gated on
//! `FRAUDESK_TEST_DB_URL`.
