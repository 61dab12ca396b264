pub mod config;
pub mod proxy;
pub mod reload;

pub use config::{BackendOptions, ConfigError, LoadBalancerOptions, PassiveMonitoringOptions};
pub use proxy::{
    Backend, BackendHealth, BackendId, BackendPool, ForwardOutcome, PassiveHealthMonitor,
    PoolError, ProxyConfig, ProxyStats, RoundRobinSelector, TcpProxy,
};
