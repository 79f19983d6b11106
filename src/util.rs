const HARVESTD_BIND_ADDR: &str = "HARVESTD_BIND_ADDR";

#[cfg(target_os = "linux")]
const DEFAULT_BIND_ADDR: &str = "@harvestd";

#[cfg(not(target_os = "linux"))]
const DEFAULT_BIND_ADDR: &str = "/tmp/.harvestd.sock";

pub fn get_default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.to_string()
}

pub fn get_bind_addr() -> Option<String> {
    std::env::var(HARVESTD_BIND_ADDR)
        .ok()
        .filter(|addr| !addr.is_empty())
}

const HARVESTD_FAST_HARVEST: &str = "HARVESTD_FAST_HARVEST";

/// Raw JSON allow-list of `{"license": seconds}`.
pub fn get_fast_harvest() -> Option<String> {
    std::env::var(HARVESTD_FAST_HARVEST).ok()
}

const DEFAULT_COLLECTOR_HOST: &str = "collector.newrelic.com";

pub fn get_default_collector_host() -> String {
    DEFAULT_COLLECTOR_HOST.to_string()
}
