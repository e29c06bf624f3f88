//! Heuristics for recognising what a publisher actually sent back.

use url::Url;

/// Markers of Cloudflare and similar interstitial bot checks.
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "cf_chl_opt",
    "challenge-platform",
    "just a moment...",
    "checking your browser before accessing",
    "attention required! | cloudflare",
    "captcha-delivery.com",
    "_incapsula_resource",
    "px-captcha",
];

/// Hosts that answer 403 to anything without a subscription session.
const PAYWALLED_DOMAINS: &[&str] = &[
    "sciencedirect.com",
    "onlinelibrary.wiley.com",
    "link.springer.com",
    "tandfonline.com",
    "journals.sagepub.com",
    "jamanetwork.com",
    "nejm.org",
    "thelancet.com",
    "cell.com",
    "academic.oup.com",
    "pubs.acs.org",
    "ieeexplore.ieee.org",
    "nature.com",
    "science.org",
    "bmj.com",
];

const SNIFF_LEN: usize = 64 * 1024;
const MAGIC_WINDOW: usize = 1024;

/// `%PDF-` within the first kilobyte. Some servers prepend junk before the header.
pub fn looks_like_pdf(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(MAGIC_WINDOW)];
    window.windows(5).any(|w| w == b"%PDF-")
}

pub fn looks_like_html(bytes: &[u8], content_type: Option<&str>) -> bool {
    if content_type.is_some_and(|ct| {
        let ct = ct.to_ascii_lowercase();
        ct.contains("text/html") || ct.contains("application/xhtml")
    }) {
        return true;
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).to_ascii_lowercase();
    let head = head.trim_start();
    head.starts_with("<!doctype html") || head.starts_with("<html") || head.contains("<html")
}

pub fn is_challenge_page(bytes: &[u8]) -> bool {
    let text = String::from_utf8_lossy(&bytes[..bytes.len().min(SNIFF_LEN)]).to_ascii_lowercase();
    CHALLENGE_MARKERS.iter().any(|m| text.contains(m))
}

pub fn is_paywalled_domain(url: &str) -> bool {
    let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_ascii_lowercase)) else {
        return false;
    };
    PAYWALLED_DOMAINS
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{d}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdf_magic() {
        assert!(looks_like_pdf(b"%PDF-1.7\n..."));
        assert!(looks_like_pdf(b"\xef\xbb\xbf\r\n%PDF-1.4"));
        assert!(!looks_like_pdf(b"<!DOCTYPE html><html>"));
        assert!(!looks_like_pdf(b""));

        let mut late = vec![b' '; 2000];
        late.extend_from_slice(b"%PDF-1.4");
        assert!(!looks_like_pdf(&late));
    }

    #[test]
    fn test_html_detection() {
        assert!(looks_like_html(b"anything", Some("text/html; charset=utf-8")));
        assert!(looks_like_html(b"  <!DOCTYPE html>\n<html>", None));
        assert!(!looks_like_html(b"%PDF-1.4", Some("application/pdf")));
    }

    #[test]
    fn test_cloudflare_challenge() {
        let body = br#"<html><head><title>Just a moment...</title></head>
            <body><script>window._cf_chl_opt={cvId: '2'}</script></body></html>"#;
        assert!(is_challenge_page(body));
        assert!(!is_challenge_page(b"<html><body>Buy this article</body></html>"));
    }

    #[test]
    fn test_paywalled_domains() {
        assert!(is_paywalled_domain("https://www.sciencedirect.com/science/article/pii/S1"));
        assert!(is_paywalled_domain("https://nature.com/articles/x"));
        assert!(!is_paywalled_domain("https://notnature.com/x"));
        assert!(!is_paywalled_domain("https://arxiv.org/pdf/1"));
    }
}
