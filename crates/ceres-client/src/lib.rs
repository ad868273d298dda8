pub mod backend;
#[cfg(feature = "browser")]
pub mod browser;
pub mod fetcher;
pub mod http_session;
pub mod llm;

pub use backend::{SearchBackend, SearchBackendKind};
#[cfg(feature = "browser")]
pub use browser::BrowserSessionFactory;
pub use fetcher::ReqwestFetcher;
pub use http_session::{HttpSearchFactory, search_url};
pub use llm::OpenAiEstimator;
