//! Browser Fingerprint Profiles
//!
//! Browser-like request headers used in three places: the default headers
//! of the capability HTTP client, the `commonHeaders` object handed to
//! provider scripts, and the header block attached to transcoder input.
//! Many upstream hosts reject requests that don't look like a browser.

use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, USER_AGENT,
};

/// Chrome (major, full) versions rotated through by [`chrome_profile`].
const CHROME_VERSIONS: &[(&str, &str)] = &[
    ("128", "128.0.6613.120"),
    ("129", "129.0.6668.90"),
    ("130", "130.0.6723.117"),
    ("131", "131.0.6778.86"),
];

const FIREFOX_VERSIONS: &[&str] = &["130.0", "131.0", "132.0"];

/// Browser profile with realistic fingerprint
#[derive(Debug, Clone)]
pub struct BrowserProfile {
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
    pub accept_encoding: String,
    pub sec_ch_ua: String,
    pub sec_ch_ua_mobile: String,
    pub sec_ch_ua_platform: String,
    pub sec_fetch_dest: String,
    pub sec_fetch_mode: String,
    pub sec_fetch_site: String,
}

/// Platform configurations
#[derive(Debug, Clone, Copy)]
pub enum Platform {
    MacOS,
    Windows,
    Linux,
}

impl Platform {
    fn random() -> Self {
        let mut rng = rand::thread_rng();
        // Realistic distribution: Windows 65%, macOS 20%, Linux 15%
        let roll: f32 = rng.gen();
        if roll < 0.65 {
            Platform::Windows
        } else if roll < 0.85 {
            Platform::MacOS
        } else {
            Platform::Linux
        }
    }

    fn os_string(self) -> &'static str {
        match self {
            Platform::MacOS => "Macintosh; Intel Mac OS X 10_15_7",
            Platform::Windows => "Windows NT 10.0; Win64; x64",
            Platform::Linux => "X11; Linux x86_64",
        }
    }

    fn sec_ch_platform(self) -> &'static str {
        match self {
            Platform::MacOS => "\"macOS\"",
            Platform::Windows => "\"Windows\"",
            Platform::Linux => "\"Linux\"",
        }
    }
}

/// Generate a realistic Chrome browser profile
#[must_use]
pub fn chrome_profile() -> BrowserProfile {
    let mut rng = rand::thread_rng();
    let platform = Platform::random();
    let (major, full) = CHROME_VERSIONS
        .choose(&mut rng)
        .copied()
        .unwrap_or(("131", "131.0.6778.86"));

    let user_agent = format!(
        "Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{full} Safari/537.36",
        platform.os_string(),
    );

    let brands = [
        format!("\"Google Chrome\";v=\"{major}\""),
        format!("\"Chromium\";v=\"{major}\""),
        "\"Not_A Brand\";v=\"24\"".to_string(),
    ];

    BrowserProfile {
        user_agent,
        accept: "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8".to_string(),
        accept_language: "en-US,en;q=0.9".to_string(),
        accept_encoding: "gzip, deflate, br, zstd".to_string(),
        sec_ch_ua: brands.join(", "),
        sec_ch_ua_mobile: "?0".to_string(),
        sec_ch_ua_platform: platform.sec_ch_platform().to_string(),
        sec_fetch_dest: "document".to_string(),
        sec_fetch_mode: "navigate".to_string(),
        sec_fetch_site: "none".to_string(),
    }
}

/// Generate a realistic Firefox browser profile
#[must_use]
pub fn firefox_profile() -> BrowserProfile {
    let mut rng = rand::thread_rng();
    let platform = Platform::random();
    let version = FIREFOX_VERSIONS.choose(&mut rng).copied().unwrap_or("132.0");

    BrowserProfile {
        user_agent: format!(
            "Mozilla/5.0 ({}; rv:{version}) Gecko/20100101 Firefox/{version}",
            platform.os_string(),
        ),
        accept:
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"
                .to_string(),
        accept_language: "en-US,en;q=0.5".to_string(),
        accept_encoding: "gzip, deflate, br, zstd".to_string(),
        // Firefox doesn't send Sec-CH-UA headers
        sec_ch_ua: String::new(),
        sec_ch_ua_mobile: String::new(),
        sec_ch_ua_platform: String::new(),
        sec_fetch_dest: "document".to_string(),
        sec_fetch_mode: "navigate".to_string(),
        sec_fetch_site: "none".to_string(),
    }
}

/// Generate a random browser profile (Chrome 80%, Firefox 20%)
#[must_use]
pub fn random_profile() -> BrowserProfile {
    if rand::thread_rng().gen::<f32>() < 0.8 {
        chrome_profile()
    } else {
        firefox_profile()
    }
}

impl BrowserProfile {
    /// Header name/value pairs in the order a browser sends them.
    #[must_use]
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("User-Agent", self.user_agent.clone()),
            ("Accept", self.accept.clone()),
            ("Accept-Language", self.accept_language.clone()),
            ("Accept-Encoding", self.accept_encoding.clone()),
        ];

        if !self.sec_ch_ua.is_empty() {
            pairs.push(("Sec-CH-UA", self.sec_ch_ua.clone()));
            pairs.push(("Sec-CH-UA-Mobile", self.sec_ch_ua_mobile.clone()));
            pairs.push(("Sec-CH-UA-Platform", self.sec_ch_ua_platform.clone()));
        }

        pairs.push(("Sec-Fetch-Dest", self.sec_fetch_dest.clone()));
        pairs.push(("Sec-Fetch-Mode", self.sec_fetch_mode.clone()));
        pairs.push(("Sec-Fetch-Site", self.sec_fetch_site.clone()));
        pairs.push(("Upgrade-Insecure-Requests", "1".to_string()));
        pairs
    }

    /// Convert profile to reqwest `HeaderMap`. Values that are not valid
    /// header text are skipped.
    pub fn to_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in self.header_pairs() {
            let name = match name {
                "User-Agent" => USER_AGENT,
                "Accept" => ACCEPT,
                "Accept-Language" => ACCEPT_LANGUAGE,
                "Accept-Encoding" => ACCEPT_ENCODING,
                other => HeaderName::from_static(static_lower(other)),
            };
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }
        headers
    }
}

/// `HeaderName::from_static` only accepts lowercase names.
fn static_lower(name: &'static str) -> &'static str {
    match name {
        "Sec-CH-UA" => "sec-ch-ua",
        "Sec-CH-UA-Mobile" => "sec-ch-ua-mobile",
        "Sec-CH-UA-Platform" => "sec-ch-ua-platform",
        "Sec-Fetch-Dest" => "sec-fetch-dest",
        "Sec-Fetch-Mode" => "sec-fetch-mode",
        "Sec-Fetch-Site" => "sec-fetch-site",
        "Upgrade-Insecure-Requests" => "upgrade-insecure-requests",
        _ => "x-unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chrome_profile() {
        let profile = chrome_profile();
        assert!(profile.user_agent.contains("Chrome"));
        assert!(!profile.sec_ch_ua.is_empty());
    }

    #[test]
    fn test_firefox_no_sec_ch_ua() {
        let profile = firefox_profile();
        assert!(profile.user_agent.contains("Firefox"));
        assert!(profile.sec_ch_ua.is_empty());
        assert!(!profile
            .header_pairs()
            .iter()
            .any(|(name, _)| name.starts_with("Sec-CH")));
    }

    #[test]
    fn test_profile_to_headers_includes_required() {
        let headers = chrome_profile().to_headers();

        assert!(headers.contains_key("user-agent"));
        assert!(headers.contains_key("accept"));
        assert!(headers.contains_key("accept-language"));
        assert!(headers.contains_key("sec-ch-ua"));
        assert!(!headers.contains_key("x-unknown"));
    }

    #[test]
    fn test_chrome_versions_format() {
        for (major, full) in CHROME_VERSIONS {
            assert!(full.starts_with(major), "Full version should start with major");
        }
    }
}
