//! Builder name normalization.
//!
//! Builders tag blocks through the free-form `extraData` field. Tags vary per
//! block (version suffixes, random nonces, emoji), so the raw bytes are
//! reduced to one canonical name with an ordered rule table. The function is
//! total: undecodable or empty input maps to [`UNKNOWN_BUILDER`].

/// Sentinel for blocks whose extra data yields no usable name.
pub const UNKNOWN_BUILDER: &str = "unknown";

/// Ordered `(needle, canonical)` rules, matched case-insensitively as
/// substrings. First match wins, so more specific needles come first.
const BUILDER_RULES: &[(&str, &str)] = &[
    ("beaverbuild", "beaverbuild"),
    ("titan", "titan"),
    ("rsync", "rsync-builder"),
    ("illuminate dmocratize dstribute", "flashbots"),
    ("illuminate dmocrtz dstrib prtct", "flashbots"),
    ("flashbots", "flashbots"),
    ("builder0x69", "builder0x69"),
    ("bloxroute", "bloxroute"),
    ("blocknative", "blocknative"),
    ("eden", "eden"),
    ("manta-builder", "manta"),
    ("buildai", "buildai"),
    ("jetbldr", "jetbuilder"),
    ("penguinbuild", "penguinbuild"),
    ("lokibuilder", "loki"),
    ("gambit", "gambit-labs"),
    ("tbuilder", "tbuilder"),
    ("payload.de", "payload"),
    ("boba-builder", "boba"),
    ("bobthebuilder", "bob-the-builder"),
    ("f1b.io", "f1b"),
    ("eth-builder", "eth-builder"),
    ("lightspeedbuilder", "lightspeed"),
    ("geth", "vanilla-geth"),
    ("nethermind", "vanilla-nethermind"),
    ("erigon", "vanilla-erigon"),
    ("besu", "vanilla-besu"),
    ("reth", "vanilla-reth"),
];

/// Canonical builder name for hex-encoded extra data (`0x...`).
pub fn builder_name_from_extra_data(extra_data_hex: &str) -> String {
    let digits = extra_data_hex
        .strip_prefix("0x")
        .unwrap_or(extra_data_hex);
    match hex::decode(digits) {
        Ok(bytes) => builder_name_from_bytes(&bytes),
        Err(_) => UNKNOWN_BUILDER.to_string(),
    }
}

/// Canonical builder name for raw extra-data bytes.
pub fn builder_name_from_bytes(bytes: &[u8]) -> String {
    let cleaned = clean_tag(bytes);
    if cleaned.is_empty() {
        return UNKNOWN_BUILDER.to_string();
    }

    let lowered = cleaned.to_ascii_lowercase();
    for (needle, canonical) in BUILDER_RULES {
        if lowered.contains(needle) {
            return (*canonical).to_string();
        }
    }
    lowered
}

/// Keep printable ASCII, collapse whitespace runs, trim punctuation at the ends.
fn clean_tag(bytes: &[u8]) -> String {
    let text: String = String::from_utf8_lossy(bytes)
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() {
                c
            } else {
                ' '
            }
        })
        .collect();

    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}
