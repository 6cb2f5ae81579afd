mod automation;
mod batch;
mod capture;
mod error;

pub use automation::BrowserProbe;
pub use batch::{MediaResolution, PlayerProbe, ResolverStats, UrlResolver};
pub use capture::{ManifestMatcher, MatchKind, MediaMatch};
pub use error::{ResolverError, ResolverResult};
