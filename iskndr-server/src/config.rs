/// Server configuration, read from `ISKNDR_*` environment variables.
/// Every value has a default; a value that is present but unparsable is
/// a startup error, not a silent fallback.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_scheme: String,
    pub base_domain: String,
    pub port: u16,
    pub logging: bool,
    pub max_tunnels: usize,
    pub max_requests_per_tunnel: usize,
}

impl Config {
    pub fn from_env() -> eyre::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> eyre::Result<Self> {
        Ok(Config {
            base_scheme: lookup("ISKNDR_BASE_SCHEME").unwrap_or_else(|| "http".to_string()),
            base_domain: lookup("ISKNDR_BASE_DOMAIN")
                .unwrap_or_else(|| "localhost.direct:8080".to_string()),
            port: parse(&lookup, "ISKNDR_PORT", 8080)?,
            logging: parse(&lookup, "ISKNDR_LOGGING", true)?,
            max_tunnels: parse(&lookup, "ISKNDR_MAX_TUNNELS", 100)?,
            max_requests_per_tunnel: parse(&lookup, "ISKNDR_MAX_REQUESTS_PER_TUNNEL", 50)?,
        })
    }

    /// The URL base public tunnel URLs are composed from, e.g.
    /// `http://localhost.direct:8080`.
    pub fn public_url_base(&self) -> String {
        format!("{}://{}", self.base_scheme, self.base_domain)
    }
}

fn parse<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> eyre::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    use eyre::WrapErr;

    match lookup(name) {
        Some(value) => value
            .parse()
            .wrap_err_with(|| format!("invalid {name}: {value}")),
        None => Ok(default),
    }
}
