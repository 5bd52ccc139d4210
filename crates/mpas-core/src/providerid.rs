//! Provider-ID codec.
//!
//! The provider-ID is the only cross-restart handle on a VM:
//! `<server>://<group>/object?type=node&name=<node>`. The scheme doubles as a
//! coarse authorization check, so decoding verifies it against the server
//! identifier before anything else.

use crate::errors::EngineError;

/// Build the provider-ID of a node group.
pub fn encode_group(server_id: &str, group_id: &str) -> String {
    format!("{server_id}://{group_id}/object?type=group")
}

/// Build the provider-ID of a node within a group.
pub fn encode_node(server_id: &str, group_id: &str, node_name: &str) -> String {
    format!("{server_id}://{group_id}/object?type=node&name={node_name}")
}

/// Extract the node-group identifier from a provider-ID.
pub fn decode_group(server_id: &str, provider_id: &str) -> Result<String, EngineError> {
    let parsed = parse(server_id, provider_id)?;
    Ok(parsed.host.to_string())
}

/// Extract the node name from a provider-ID.
///
/// Absence of the `name` query parameter yields an empty string; the caller
/// decides whether that is an error.
pub fn decode_node(server_id: &str, provider_id: &str) -> Result<String, EngineError> {
    let parsed = parse(server_id, provider_id)?;
    Ok(parsed.query_param("name").unwrap_or_default().to_string())
}

struct ParsedId<'a> {
    host: &'a str,
    query: &'a str,
}

impl<'a> ParsedId<'a> {
    fn query_param(&self, key: &str) -> Option<&'a str> {
        self.query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

fn parse<'a>(server_id: &str, provider_id: &'a str) -> Result<ParsedId<'a>, EngineError> {
    let malformed =
        |reason: &str| EngineError::MalformedID(provider_id.to_string(), reason.to_string());

    let (scheme, rest) = provider_id
        .split_once("://")
        .ok_or_else(|| malformed("missing scheme separator"))?;

    if scheme != server_id {
        return Err(malformed(&format!(
            "expect scheme {server_id}, got: {scheme}"
        )));
    }

    let (location, query) = rest.split_once('?').unwrap_or((rest, ""));
    let (host, path) = location.split_once('/').unwrap_or((location, ""));

    if host.is_empty() {
        return Err(malformed("missing group identifier"));
    }

    // Both "object" and "/object" are accepted; the split strips one slash.
    if path.trim_start_matches('/') != "object" {
        return Err(malformed(&format!("expect path object, got: {path}")));
    }

    Ok(ParsedId { host, query })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER: &str = "multipass";

    #[test]
    fn test_encode_group_format() {
        assert_eq!(
            encode_group(SERVER, "ng-42"),
            "multipass://ng-42/object?type=group"
        );
    }

    #[test]
    fn test_encode_node_format() {
        assert_eq!(
            encode_node(SERVER, "ng-42", "ng-42-vm-01"),
            "multipass://ng-42/object?type=node&name=ng-42-vm-01"
        );
    }

    #[test]
    fn test_node_roundtrip() {
        // P3: decode(encode(...)) recovers both parts.
        let id = encode_node(SERVER, "ng-42", "ng-42-vm-07");
        assert_eq!(decode_group(SERVER, &id).unwrap(), "ng-42");
        assert_eq!(decode_node(SERVER, &id).unwrap(), "ng-42-vm-07");
    }

    #[test]
    fn test_group_roundtrip() {
        let id = encode_group(SERVER, "workers");
        assert_eq!(decode_group(SERVER, &id).unwrap(), "workers");
    }

    #[test]
    fn test_wrong_scheme_rejected() {
        // P4: a foreign scheme always fails decoding.
        let id = "aws://ng-42/object?type=node&name=ip-10-0-0-1";
        assert!(matches!(
            decode_node(SERVER, id),
            Err(EngineError::MalformedID(..))
        ));
        assert!(matches!(
            decode_group(SERVER, id),
            Err(EngineError::MalformedID(..))
        ));
    }

    #[test]
    fn test_missing_scheme_separator_rejected() {
        assert!(decode_group(SERVER, "not-a-provider-id").is_err());
        assert!(decode_group(SERVER, "").is_err());
    }

    #[test]
    fn test_wrong_path_rejected() {
        let id = "multipass://ng-42/instance?type=node&name=x";
        assert!(matches!(
            decode_node(SERVER, id),
            Err(EngineError::MalformedID(..))
        ));
    }

    #[test]
    fn test_path_with_leading_slash_accepted() {
        let id = "multipass://ng-42//object?type=node&name=ng-42-vm-01";
        assert_eq!(decode_node(SERVER, id).unwrap(), "ng-42-vm-01");
    }

    #[test]
    fn test_missing_name_yields_empty_string() {
        let id = encode_group(SERVER, "ng-42");
        assert_eq!(decode_node(SERVER, &id).unwrap(), "");
    }

    #[test]
    fn test_missing_group_rejected() {
        assert!(decode_group(SERVER, "multipass:///object?type=group").is_err());
    }
}
