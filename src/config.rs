/// Configuration for a [`Client`](crate::client::Client).
///
/// This controls when queries are allowed to touch the network during server
/// rendering and right after hydration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Whether the client runs in the interactive environment.
    ///
    /// On a server rendering pass (`false`) a query only fetches when nothing is
    /// cached for it yet, so one render never issues duplicate requests.
    pub is_client: bool,

    /// Disables every network request on a server rendering pass.
    pub disable_ssr: bool,

    /// Skips the network for requests that already have data or an error in
    /// cache until [`Client::on_hydrate_complete`] is called.
    ///
    /// [`Client::on_hydrate_complete`]: crate::client::Client::on_hydrate_complete
    pub optimize_on_hydrate: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            is_client: true,
            disable_ssr: false,
            optimize_on_hydrate: true,
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration with every field given explicitly.
    #[must_use]
    pub const fn new(is_client: bool, disable_ssr: bool, optimize_on_hydrate: bool) -> Self {
        Self {
            is_client,
            disable_ssr,
            optimize_on_hydrate,
        }
    }

    /// Configuration for a server rendering pass.
    #[must_use]
    pub const fn server() -> Self {
        Self::new(false, false, true)
    }

    #[must_use]
    pub const fn with_disable_ssr(mut self, disable_ssr: bool) -> Self {
        self.disable_ssr = disable_ssr;
        self
    }

    #[must_use]
    pub const fn with_optimize_on_hydrate(mut self, optimize: bool) -> Self {
        self.optimize_on_hydrate = optimize;
        self
    }
}
