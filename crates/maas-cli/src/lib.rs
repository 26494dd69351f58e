//! MAAS CLI library — command implementations shared by the `maas` binary
//! and the integration tests.

pub mod commands;
