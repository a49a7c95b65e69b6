use uuid::Uuid;

const RFQ_ID_RANDOM_CHARS: usize = 12;

/// `r_` followed by upper-case alphanumerics. Collisions are handled by the
/// caller's `IfAbsent` write, not here.
pub fn generate_rfq_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("r_{}", raw[..RFQ_ID_RANDOM_CHARS].to_ascii_uppercase())
}

/// Time-ordered (UUID v7) so ids minted later by one process sort later.
pub fn generate_event_id() -> String {
    format!("ev_{}", Uuid::now_v7().simple())
}

pub fn generate_attachment_id() -> String {
    format!("att_{}", Uuid::new_v4().simple())
}

pub fn generate_claim_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn is_valid_rfq_id(candidate: &str) -> bool {
    candidate
        .strip_prefix("r_")
        .is_some_and(|rest| {
            !rest.is_empty() && rest.len() <= 64 && rest.chars().all(|c| c.is_ascii_alphanumeric())
        })
}

pub fn is_valid_manufacturer_id(candidate: &str) -> bool {
    candidate.strip_prefix("mfg_").is_some_and(|rest| {
        !rest.is_empty()
            && rest.len() <= 64
            && rest
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    })
}
