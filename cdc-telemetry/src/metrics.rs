use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Port of the Prometheus scrape endpoint.
const METRICS_PORT: u16 = 9000;

/// Installs the global metrics recorder and serves it on `[::]:9000/metrics`.
///
/// Every `(key, value)` pair in `global_labels` is attached to all exported series, which is how
/// run labels reach the metrics backend. Must be called from within a tokio runtime.
pub fn init_metrics<'a, I>(global_labels: I) -> Result<(), BuildError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let builder = PrometheusBuilder::new().with_http_listener(SocketAddr::new(
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        METRICS_PORT,
    ));

    global_labels
        .into_iter()
        .fold(builder, |builder, (key, value)| {
            builder.add_global_label(key, value)
        })
        .install()
}
