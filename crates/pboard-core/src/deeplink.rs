use std::sync::{Arc, Mutex};

use tracing::debug;

/// Consumer attached to the router; receives each routed URL exactly once.
pub type DeepLinkCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Single-slot buffer for a URL that arrived before a consumer was ready.
///
/// Last write wins: a second URL arriving before the flush replaces the
/// first rather than queueing behind it.
#[derive(Debug, Default)]
struct PendingSlot(Option<String>);

impl PendingSlot {
    /// Returns the URL that was displaced, if any.
    fn set(&mut self, url: String) -> Option<String> {
        self.0.replace(url)
    }

    fn take(&mut self) -> Option<String> {
        self.0.take()
    }
}

#[derive(Default)]
struct RouterInner {
    pending: PendingSlot,
    callback: Option<DeepLinkCallback>,
}

/// Funnels every platform delivery path for custom-scheme URLs into one
/// consumer: direct OS callback events, forwarded second-instance argv, and
/// the initial-launch argv scan.
#[derive(Default)]
pub struct DeepLinkRouter {
    inner: Mutex<RouterInner>,
}

impl DeepLinkRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the consumer. A buffered URL is flushed to it immediately.
    pub fn set_callback(&self, callback: DeepLinkCallback) {
        let flushed = {
            let mut inner = self.lock();
            inner.callback = Some(callback.clone());
            inner.pending.take()
        };
        // Delivery happens outside the lock so the consumer may call back in.
        if let Some(url) = flushed {
            debug!(%url, "flushing buffered deep link to new consumer");
            callback(url);
        }
    }

    /// Route one URL: deliver synchronously if a consumer is attached,
    /// otherwise buffer it (overwriting any earlier pending URL).
    pub fn handle_url(&self, url: impl Into<String>) {
        let url = url.into();
        let callback = {
            let mut inner = self.lock();
            match inner.callback.clone() {
                Some(callback) => Some(callback),
                None => {
                    if let Some(displaced) = inner.pending.set(url.clone()) {
                        debug!(%displaced, "pending deep link overwritten");
                    }
                    None
                }
            }
        };
        if let Some(callback) = callback {
            callback(url);
        }
    }

    /// Scan an argument vector for a scheme-prefixed URL and route it.
    ///
    /// Used both at first launch and when a rejected second instance forwards
    /// its argv. Absence of a match is a no-op.
    pub fn route_from_args<I, S>(&self, args: I, scheme: &str) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        match scan_args(args, scheme) {
            Some(url) => {
                self.handle_url(url);
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RouterInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Find the first argument beginning with `<scheme>://`.
pub fn scan_args<I, S>(args: I, scheme: &str) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let prefix = format!("{scheme}://");
    args.into_iter()
        .map(|arg| arg.as_ref().to_string())
        .find(|arg| arg.starts_with(&prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_callback() -> (DeepLinkCallback, Arc<Mutex<Vec<String>>>) {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let callback: DeepLinkCallback = Arc::new(move |url| {
            sink.lock().unwrap().push(url);
        });
        (callback, delivered)
    }

    #[test]
    fn url_before_consumer_is_delivered_exactly_once_on_attach() {
        let router = DeepLinkRouter::new();
        router.handle_url("pulseboard://auth/callback?code=1");

        let (callback, delivered) = recording_callback();
        router.set_callback(callback);

        assert_eq!(
            delivered.lock().unwrap().as_slice(),
            ["pulseboard://auth/callback?code=1"]
        );

        // The slot was flushed; re-attaching must not replay it.
        let (callback, redelivered) = recording_callback();
        router.set_callback(callback);
        assert!(redelivered.lock().unwrap().is_empty());
    }

    #[test]
    fn second_pending_url_overwrites_the_first() {
        let router = DeepLinkRouter::new();
        router.handle_url("pulseboard://first");
        router.handle_url("pulseboard://second");

        let (callback, delivered) = recording_callback();
        router.set_callback(callback);

        assert_eq!(delivered.lock().unwrap().as_slice(), ["pulseboard://second"]);
    }

    #[test]
    fn attached_consumer_receives_urls_synchronously() {
        let router = DeepLinkRouter::new();
        let (callback, delivered) = recording_callback();
        router.set_callback(callback);

        router.handle_url("pulseboard://a");
        router.handle_url("pulseboard://b");

        assert_eq!(
            delivered.lock().unwrap().as_slice(),
            ["pulseboard://a", "pulseboard://b"]
        );
    }

    #[test]
    fn argv_scan_matches_scheme_prefix_only() {
        let args = [
            "/usr/bin/pboard",
            "--verbose",
            "pulseboard://auth/callback?code=9",
        ];
        assert_eq!(
            scan_args(args, "pulseboard").as_deref(),
            Some("pulseboard://auth/callback?code=9")
        );
        assert!(scan_args(["pboard", "https://example.com"], "pulseboard").is_none());
    }

    #[test]
    fn route_from_args_is_noop_without_match() {
        let router = DeepLinkRouter::new();
        let (callback, delivered) = recording_callback();
        router.set_callback(callback);

        assert!(!router.route_from_args(["pboard", "--help"], "pulseboard"));
        assert!(delivered.lock().unwrap().is_empty());
    }
}
