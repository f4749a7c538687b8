use std::net::IpAddr;

use url::Url;

use crate::error::Error;

/// Hosts the pipeline is allowed to talk to. Everything else is rejected
/// before any socket is opened.
pub const ALLOWED_HOSTS: &[&str] = &[
    "api.mangadex.org",
    "mangadex.org",
    "mangapark.io",
    "www.mangapark.io",
    "comick.io",
    "api.comick.io",
    "mangasee123.com",
    "www.mangasee123.com",
];

/// Validate an outbound target. Accepts only https URLs whose host is on
/// the allow-list; IP literals and unregistrable names never match.
pub fn validate(raw: &str) -> Result<Url, Error> {
    let url = Url::parse(raw).map_err(|e| Error::InvalidInput(format!("bad url {:?}: {}", raw, e)))?;

    if url.scheme() != "https" {
        return Err(Error::InvalidInput(format!(
            "refusing non-https scheme {:?}",
            url.scheme()
        )));
    }

    let host = match url.host_str() {
        Some(h) => h,
        None => return Err(Error::InvalidInput("url has no host".into())),
    };

    if host.parse::<IpAddr>().is_ok() {
        return Err(Error::InvalidInput(format!(
            "refusing ip-literal host {:?}",
            host
        )));
    }

    // The allow-list already pins hosts, but a name that does not parse
    // against the public suffix list (no known TLD, embedded userinfo
    // tricks) is rejected outright.
    if addr::parse_domain_name(host).is_err() {
        return Err(Error::InvalidInput(format!(
            "host {:?} is not a registrable domain",
            host
        )));
    }

    if !ALLOWED_HOSTS.iter().any(|allowed| *allowed == host) {
        return Err(Error::InvalidInput(format!(
            "host {:?} is not an allowed source host",
            host
        )));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn accepts_allowed_hosts() {
        assert!(validate("https://api.mangadex.org/manga/abc").is_ok());
        assert!(validate("https://mangapark.io/title/123").is_ok());
        assert!(validate("https://www.mangasee123.com/rss/Oyasumi-Punpun.xml").is_ok());
    }

    #[test]
    fn rejects_unknown_hosts() {
        let err = validate("https://evil.example.com/manga").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn rejects_ip_literals_and_plain_http() {
        assert!(validate("https://127.0.0.1/manga").is_err());
        assert!(validate("https://169.254.169.254/latest/meta-data").is_err());
        assert!(validate("http://api.mangadex.org/manga").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(validate("not a url").is_err());
        assert!(validate("https:///nohost").is_err());
    }
}
