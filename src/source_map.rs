// Inline source map extraction for debug bundles

use regex::Regex;
use sourcemap::{DecodedMap, SourceMap};
use std::sync::OnceLock;

const DATA_URL_PREFIX: &str = "data:application/json;";

fn comment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*//[#@]\s*sourceMappingURL=(\S+)\s*$").expect("Invalid regex")
    })
}

/// Build the trailing comment that embeds `map` into a bundle
pub fn inline_comment(map: &SourceMap) -> Result<String, sourcemap::Error> {
    Ok(format!("//# sourceMappingURL={}", map.to_data_url()?))
}

/// Extract the inline source map embedded in `content`, if any
///
/// Only the last `sourceMappingURL` comment counts. External map URLs and
/// undecodable payloads yield `None`.
pub fn extract_inline(content: &str) -> Option<SourceMap> {
    let url = comment_regex()
        .captures_iter(content)
        .last()
        .and_then(|caps| caps.get(1))?
        .as_str();

    let Some(params) = url.strip_prefix(DATA_URL_PREFIX) else {
        tracing::debug!(url, "source map is not inlined");
        return None;
    };

    // `decode_data_url` only accepts the bare base64 form, without a charset
    let Some((_, payload)) = params.split_once("base64,") else {
        tracing::warn!("inline source map is not base64 encoded");
        return None;
    };

    match sourcemap::decode_data_url(&format!("{}base64,{}", DATA_URL_PREFIX, payload)) {
        Ok(DecodedMap::Regular(map)) => Some(map),
        Ok(_) => {
            tracing::warn!("inline source map is an index or hermes map");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to decode inline source map");
            None
        }
    }
}
