/// Who is asking, as far as quota decisions go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaScope<'a> {
    pub route: &'a str,
    pub client: Option<&'a str>,
}

/// Consulted before any request work. `Err` carries the reason returned to
/// the caller with a 429.
pub trait QuotaGate {
    fn check(&self, scope: &QuotaScope<'_>) -> Result<(), String>;
}

/// Quotas are enforced by the gateway in front of the function.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllQuota;

impl QuotaGate for AllowAllQuota {
    fn check(&self, _scope: &QuotaScope<'_>) -> Result<(), String> {
        Ok(())
    }
}

impl<F> QuotaGate for F
where
    F: Fn(&QuotaScope<'_>) -> Result<(), String>,
{
    fn check(&self, scope: &QuotaScope<'_>) -> Result<(), String> {
        self(scope)
    }
}
