use serde::Deserialize;

use crate::config::MatchingSection;

/// Installed before any page script runs. Wraps `fetch` and `XMLHttpRequest`
/// so every request URL the player issues survives in a page-global bucket
/// that later polls can read back.
pub(crate) const NETWORK_HOOK: &str = r#"
(() => {
    const bucket = [];
    const push = (entry) => {
        try {
            bucket.push(entry);
        } catch (_) {
            // ignore
        }
    };
    Object.defineProperty(window, '__talkreelRequests', {
        value: bucket,
        writable: false,
        configurable: false,
    });

    const originalFetch = window.fetch;
    window.fetch = async (...args) => {
        const response = await originalFetch(...args);
        try {
            const request = args[0];
            const url = typeof request === 'string' ? request : request.url;
            push({ url: String(url || ''), type: 'fetch', status: response.status });
        } catch (_) {}
        return response;
    };

    const OriginalXHR = window.XMLHttpRequest;
    window.XMLHttpRequest = function() {
        const xhr = new OriginalXHR();
        let url = '';
        let method = 'GET';
        const open = xhr.open;
        xhr.open = function(m, u) {
            method = m || 'GET';
            url = u || '';
            return open.apply(xhr, arguments);
        };
        xhr.addEventListener('loadend', function() {
            push({ url: String(url || ''), type: 'xhr', status: xhr.status, method });
        });
        return xhr;
    };
})();
"#;

pub(crate) const CAPTURE_SCRIPT: &str = r#"
(() => {
    const video = document.querySelector('video');
    const captured = Array.from(window.__talkreelRequests || []);
    const sources = [];
    if (video) {
        if (video.currentSrc) {
            sources.push({ url: video.currentSrc });
        }
        video.querySelectorAll('source').forEach(src => {
            const srcUrl = src.src || (src.dataset ? src.dataset.src : '');
            if (srcUrl) {
                sources.push({ url: srcUrl });
            }
        });
    }
    return { current: video ? (video.currentSrc || null) : null, captured, sources };
})()
"#;

#[derive(Debug, Deserialize)]
pub(crate) struct CapturePayload {
    pub current: Option<String>,
    pub captured: Vec<CapturedRequest>,
    pub sources: Vec<VideoSource>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CapturedRequest {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VideoSource {
    pub url: String,
}

impl CapturePayload {
    /// Network requests in arrival order, then the element source candidates.
    pub fn observed_urls(&self) -> impl Iterator<Item = &str> {
        self.captured
            .iter()
            .map(|request| request.url.as_str())
            .chain(self.current.as_deref())
            .chain(self.sources.iter().map(|source| source.url.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchKind {
    Preferred,
    Generic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaMatch {
    pub url: String,
    pub kind: MatchKind,
}

/// Decides which observed URL, if any, is the media manifest worth keeping.
#[derive(Debug, Clone)]
pub struct ManifestMatcher {
    preferred_fragment: Option<String>,
    markers: Vec<String>,
    direct_hosts: Vec<String>,
}

impl ManifestMatcher {
    pub fn new(section: &MatchingSection) -> Self {
        Self {
            preferred_fragment: section.preferred_fragment.clone(),
            markers: section.manifest_markers.clone(),
            direct_hosts: section.direct_hosts.clone(),
        }
    }

    /// A direct URL is already fetchable and never goes through a browser.
    pub fn is_direct(&self, url: &str) -> bool {
        self.direct_hosts.iter().any(|host| url.contains(host))
    }

    /// Scans one batch of observed URLs. A URL carrying the preferred
    /// fragment wins immediately; otherwise the first URL carrying any
    /// generic manifest marker is kept as fallback.
    pub fn select<'a, I>(&self, urls: I) -> Option<MediaMatch>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut fallback: Option<String> = None;
        for url in urls {
            if let Some(fragment) = &self.preferred_fragment {
                if url.contains(fragment.as_str()) {
                    return Some(MediaMatch {
                        url: url.to_string(),
                        kind: MatchKind::Preferred,
                    });
                }
            }
            if fallback.is_none() && self.markers.iter().any(|marker| url.contains(marker)) {
                fallback = Some(url.to_string());
            }
        }
        fallback.map(|url| MediaMatch {
            url,
            kind: MatchKind::Generic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(preferred: Option<&str>) -> ManifestMatcher {
        ManifestMatcher::new(&MatchingSection {
            preferred_fragment: preferred.map(str::to_string),
            manifest_markers: vec![".m3u8".into()],
            direct_hosts: vec!["vkvideo.ru".into(), "vk.com".into()],
            poll_window_seconds: 5,
            poll_step_millis: 100,
        })
    }

    #[test]
    fn preferred_fragment_beats_earlier_generic_match() {
        let matcher = matcher(Some("ru.m3u8"));
        let urls = [
            "https://cdn.example/talk/index.m3u8",
            "https://cdn.example/talk/ru.m3u8",
        ];
        let found = matcher.select(urls).unwrap();
        assert_eq!(found.kind, MatchKind::Preferred);
        assert_eq!(found.url, "https://cdn.example/talk/ru.m3u8");
    }

    #[test]
    fn falls_back_to_first_generic_match() {
        let matcher = matcher(Some("ru.m3u8"));
        let urls = [
            "https://cdn.example/talk/seg-0001.ts",
            "https://cdn.example/talk/en.m3u8",
            "https://cdn.example/talk/de.m3u8",
        ];
        let found = matcher.select(urls).unwrap();
        assert_eq!(found.kind, MatchKind::Generic);
        assert_eq!(found.url, "https://cdn.example/talk/en.m3u8");
    }

    #[test]
    fn no_match_when_nothing_observed() {
        let matcher = matcher(Some("ru.m3u8"));
        assert!(matcher
            .select(["https://cdn.example/app.js", "https://cdn.example/poster.jpg"])
            .is_none());
        assert!(matcher.select([]).is_none());
    }

    #[test]
    fn works_without_a_preferred_fragment() {
        let matcher = matcher(None);
        let found = matcher
            .select(["https://cdn.example/talk/de.m3u8", "https://cdn.example/talk/ru.m3u8"])
            .unwrap();
        assert_eq!(found.kind, MatchKind::Generic);
        assert_eq!(found.url, "https://cdn.example/talk/de.m3u8");
    }

    #[test]
    fn classifies_direct_hosts_by_substring() {
        let matcher = matcher(None);
        assert!(matcher.is_direct("https://vkvideo.ru/video-123_456"));
        assert!(matcher.is_direct("https://vk.com/video_ext.php?id=1"));
        assert!(!matcher.is_direct("https://front.finevid.link/player/1"));
    }
}
