//! Process-global tunables (spec §6), collected into a value type instead of
//! static fields so multiple independent `DeviceFinder`/`ConnectionManager`
//! instances (as used in tests) never fight over shared mutable constants.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Device expiration threshold. Default 10,000 ms.
    pub max_age: Duration,
    /// UDP port the announcement listener binds to. Fixed at 50000 in
    /// production; overridable here so tests can bind an ephemeral port.
    pub announcement_port: u16,
    /// TCP port the DBServer port-query handshake targets. Fixed at 12523.
    pub db_server_query_port: u16,
    /// Connect/read timeout used for DBServer probes and sessions.
    pub socket_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_age: Duration::from_millis(10_000),
            announcement_port: 50_000,
            db_server_query_port: 12_523,
            socket_timeout: Duration::from_millis(10_000),
        }
    }
}
