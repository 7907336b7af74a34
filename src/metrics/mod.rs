use prometheus_client::registry::Registry;

mod meta;
pub mod redirect;
pub mod server;

/// Agent metrics derived from reconciler events.
pub struct Metrics {
    #[allow(dead_code)]
    meta: meta::Metrics,
    pub redirect: std::sync::Arc<redirect::Metrics>,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        Self {
            meta: meta::Metrics::new(registry),
            redirect: std::sync::Arc::new(redirect::Metrics::new(registry)),
        }
    }
}

/// Recorder that can record events
pub trait Recorder<E> {
    /// Record the given event.
    fn record(&self, event: &E);
}
