use crate::config::{Config, TransportKind};
use crate::dispatch::cli::CliDispatch;
use crate::dispatch::http::HttpDispatch;
use crate::dispatch::{GenerateRequest, GenerateResult, Strategy};
use crate::error::TestgenError;

/// Routes a `Strategy` to its transport. Every strategy goes through the
/// same deadline check and error classification, so the orchestrator can
/// treat the fallback chain as a plain list.
pub struct TransportRegistry {
    base_url: String,
    http: HttpDispatch,
    cli: CliDispatch,
}

impl TransportRegistry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.server_url.clone(),
            http: HttpDispatch::new(),
            cli: CliDispatch::new(config.curl_bin.clone()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn http(&self) -> &HttpDispatch {
        &self.http
    }

    pub fn cli(&self) -> &CliDispatch {
        &self.cli
    }

    pub async fn generate(
        &self,
        strategy: Strategy,
        req: &GenerateRequest,
    ) -> Result<GenerateResult, TestgenError> {
        // Expired deadlines fail before any I/O, whichever transport.
        req.remaining()?;

        match strategy {
            Strategy::Stream => self.http.generate(req, &self.base_url, true).await,
            Strategy::Buffered => self.http.generate(req, &self.base_url, false).await,
            Strategy::Process => self.cli.generate(req, &self.base_url).await,
        }
    }
}

/// Ordered fallback chain for one generation unit.
///
/// Incremental generation always streams first. Combined generation streams
/// first only when asked to. The process transport is appended last, or
/// moved to the front when it is the selected transport.
pub fn strategy_chain(config: &Config) -> Vec<Strategy> {
    let stream_first = config.is_incremental() || config.stream_first;
    let mut chain = if stream_first {
        vec![Strategy::Stream, Strategy::Buffered]
    } else {
        vec![Strategy::Buffered, Strategy::Stream]
    };

    match config.transport {
        TransportKind::Process => chain.insert(0, Strategy::Process),
        TransportKind::Http => chain.push(Strategy::Process),
    }
    chain
}
