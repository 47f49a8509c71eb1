/*
* File: src/controllers/parser.rs
*
* Pattern matching over the downloader job's log output. The downloader
* prints the served model's name and a deployment configuration token in a
* fixed format; this module extracts both and decodes the token into a
* server profile (server type, accelerator count, accelerator memory).
*
* Unparsable input is a hard error: it signals a contract violation by the
* downloader image rather than a transient condition worth retrying blindly.
*
* SPDX-License-Identifier: Apache-2.0
*/

use regex::Regex;
use thiserror::Error;

use crate::crds::ServerInfo;

/// Server types the operator knows how to place jobs onto.
const SUPPORTED_SERVER_TYPES: &[&str] = &["atlas800ia2"];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unable to extract model name from logs")]
    ModelNameNotFound,

    #[error("unable to extract deployment config token from logs")]
    ConfigTokenNotFound,

    #[error("unable to extract server info from config token '{0}'")]
    MalformedConfigToken(String),

    #[error("config token carries unsupported server type '{0}'")]
    UnsupportedServerType(String),

    #[error("unable to parse accelerator count '{0}'")]
    BadCardNum(String),
}

/// Extract the model name from downloader logs. The downloader prints a line
/// of the form `[MIS Downloader] [model] [<name>]`.
pub fn extract_model_name(logs: &str) -> Result<String, ParseError> {
    let re = Regex::new(r"\[MIS Downloader] \[model] \[([\dA-Za-z.-]+)]").expect("static regex");
    re.captures(logs)
        .map(|caps| caps[1].to_string())
        .ok_or(ParseError::ModelNameNotFound)
}

/// Extract the deployment configuration token from downloader logs, printed
/// as `[MIS Downloader] [MIS_CONFIG] [<token>]`.
pub fn extract_config_token(logs: &str) -> Result<String, ParseError> {
    let re = Regex::new(r"\[MIS Downloader] \[MIS_CONFIG] \[([\da-z-]+)]").expect("static regex");
    re.captures(logs)
        .map(|caps| caps[1].to_string())
        .ok_or(ParseError::ConfigTokenNotFound)
}

/// Decode a configuration token into a server profile. The token embeds
/// `<serverType>-<cardNum>x<cardMem>gb`; memory is upper-cased with the
/// trailing `b` dropped (`32gb` -> "32G").
pub fn decode_server_info(token: &str) -> Result<ServerInfo, ParseError> {
    let re = Regex::new(r"([\da-z]+)-(\d+)x(\d+g)b").expect("static regex");
    let caps = re
        .captures(token)
        .ok_or_else(|| ParseError::MalformedConfigToken(token.to_string()))?;

    let server_type = caps[1].to_string();
    if !SUPPORTED_SERVER_TYPES.contains(&server_type.as_str()) {
        return Err(ParseError::UnsupportedServerType(server_type));
    }

    let card_num: i64 = caps[2]
        .parse()
        .map_err(|_| ParseError::BadCardNum(caps[2].to_string()))?;

    Ok(ServerInfo {
        server_type,
        card_num,
        card_memory: caps[3].to_uppercase(),
    })
}

/// Whether a string is a plausible Kubernetes resource quantity
/// (decimal number with an optional SI or binary suffix).
pub fn is_valid_quantity(s: &str) -> bool {
    let re = Regex::new(r"^\d+(\.\d+)?(m|k|M|G|T|P|E|Ki|Mi|Gi|Ti|Pi|Ei)?$").expect("static regex");
    re.is_match(s)
}
