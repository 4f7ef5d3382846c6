use chrono::{DateTime, Utc};
use domain::{SagaState, SagaStatus};

/// Filter for selecting sagas, used by the background scanners.
///
/// All set criteria must match. Results are ordered by creation time.
#[derive(Debug, Clone, Default)]
pub struct SagaQuery {
    /// Sagas in any of these statuses.
    pub statuses: Option<Vec<SagaStatus>>,

    /// Sagas whose `timeout_at` is at or before this instant.
    pub timed_out_at: Option<DateTime<Utc>>,

    /// Sagas last updated strictly before this instant.
    pub updated_before: Option<DateTime<Utc>>,

    /// Maximum number of sagas to return.
    pub limit: Option<usize>,
}

impl SagaQuery {
    /// Creates an empty query matching every saga.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to the given statuses.
    pub fn statuses(mut self, statuses: &[SagaStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    /// Restricts to sagas whose deadline has passed at `now`.
    pub fn timed_out_at(mut self, now: DateTime<Utc>) -> Self {
        self.timed_out_at = Some(now);
        self
    }

    /// Restricts to sagas untouched since `cutoff`.
    pub fn updated_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.updated_before = Some(cutoff);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Evaluates the filter against one saga (used by the in-memory store).
    pub fn matches(&self, saga: &SagaState) -> bool {
        if let Some(ref statuses) = self.statuses
            && !statuses.contains(&saga.status)
        {
            return false;
        }
        if let Some(now) = self.timed_out_at
            && !saga.is_timed_out(now)
        {
            return false;
        }
        if let Some(cutoff) = self.updated_before
            && !saga.is_stale(cutoff)
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common::{OrderId, SagaId};

    fn saga(now: DateTime<Utc>) -> SagaState {
        SagaState::start(SagaId::new(), OrderId::new(1), Duration::seconds(60), now)
    }

    #[test]
    fn empty_query_matches_everything() {
        assert!(SagaQuery::new().matches(&saga(Utc::now())));
    }

    #[test]
    fn status_filter() {
        let s = saga(Utc::now());
        assert!(
            SagaQuery::new()
                .statuses(&[SagaStatus::Waiting, SagaStatus::Processing])
                .matches(&s)
        );
        assert!(!SagaQuery::new().statuses(&[SagaStatus::Completed]).matches(&s));
    }

    #[test]
    fn timeout_filter() {
        let now = Utc::now();
        let s = saga(now);
        assert!(!SagaQuery::new().timed_out_at(now).matches(&s));
        assert!(
            SagaQuery::new()
                .timed_out_at(now + Duration::seconds(61))
                .matches(&s)
        );
    }

    #[test]
    fn staleness_filter() {
        let now = Utc::now();
        let s = saga(now);
        assert!(!SagaQuery::new().updated_before(now).matches(&s));
        assert!(
            SagaQuery::new()
                .updated_before(now + Duration::minutes(1))
                .matches(&s)
        );
    }
}
