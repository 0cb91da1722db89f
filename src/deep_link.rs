use url::Url;

/// Query parameter carrying the referral code in deep links, unless configured otherwise.
pub const DEFAULT_DEEP_LINK_PARAM: &str = "shinara_code";

/// Extract the value of query parameter `param` from `link`.
///
/// Returns `None` for malformed links and for a missing or empty parameter.
pub(crate) fn extract_code(link: &str, param: &str) -> Option<String> {
    let url = match Url::parse(link) {
        Ok(url) => url,
        Err(err) => {
            log::trace!(target: "shinara", link; "ignoring malformed deep link: {:?}", err);
            return None;
        }
    };

    url.query_pairs()
        .find(|(name, _)| name == param)
        .map(|(_, value)| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}
