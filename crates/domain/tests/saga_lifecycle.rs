//! Integration tests for the saga lifecycle.
//!
//! These walk whole sagas through the transition table the way the
//! orchestrator does, checking the audit events that go with each step.

use chrono::{Duration, Utc};
use common::{Money, OrderId, PaymentId, SagaId};
use domain::{
    DomainError, NewOrder, NewSagaEvent, OrderStatus, SagaEventType, SagaState, SagaStatus,
    SagaStep,
};

fn started() -> SagaState {
    SagaState::start(SagaId::new(), OrderId::new(1), Duration::seconds(30), Utc::now())
}

mod happy_path {
    use super::*;

    #[test]
    fn waiting_to_completed() {
        let saga = started();
        assert_eq!(saga.status, SagaStatus::Waiting);
        assert_eq!(saga.current_step, SagaStep::OrderCreated);

        let now = Utc::now();
        let processing = saga
            .transitioned(SagaStatus::Processing, SagaStep::PaymentProcessing, now)
            .unwrap();
        let completed = processing
            .transitioned(SagaStatus::Completed, SagaStep::PaymentCompleted, now)
            .unwrap();

        assert!(completed.status.is_terminal());
        assert_eq!(completed.saga_id, saga.saga_id);
        assert_eq!(completed.version, saga.version);
    }

    #[test]
    fn started_event_carries_the_order() {
        let order = NewOrder::new("cust-1", "prod-1", 3, Money::from_cents(4_500))
            .into_order(OrderId::new(9), Utc::now());
        assert_eq!(order.status, OrderStatus::Waiting);

        let event = NewSagaEvent::saga_started(
            order.id,
            &order.customer_id,
            &order.product_id,
            order.quantity,
            order.amount,
        );

        assert_eq!(event.event_type, SagaEventType::SagaStarted);
        assert_eq!(event.event_data["customerId"], "cust-1");
        assert_eq!(event.event_data["quantity"], 3);
    }
}

mod failure_paths {
    use super::*;

    #[test]
    fn processing_compensates_then_fails() {
        let now = Utc::now();
        let saga = started()
            .transitioned(SagaStatus::Processing, SagaStep::PaymentProcessing, now)
            .unwrap();
        assert!(saga.status.can_compensate());

        let compensating = saga
            .transitioned(SagaStatus::Compensating, SagaStep::Compensating, now)
            .unwrap();
        assert!(!compensating.status.is_terminal());

        let done = compensating
            .transitioned(SagaStatus::Failed, SagaStep::Compensated, now)
            .unwrap();
        assert_eq!(done.status, SagaStatus::Failed);
        assert_eq!(done.current_step, SagaStep::Compensated);
    }

    #[test]
    fn waiting_saga_times_out_without_payment() {
        let now = Utc::now();
        let saga = SagaState::start(SagaId::new(), OrderId::new(2), Duration::seconds(30), now);

        assert!(!saga.is_timed_out(now));
        assert!(saga.is_timed_out(now + Duration::seconds(30)));

        let timed_out = saga
            .transitioned(SagaStatus::NoPayment, SagaStep::Timeout, now)
            .unwrap();
        assert!(timed_out.status.is_terminal());
        assert!(!timed_out.status.can_compensate());
    }

    #[test]
    fn processing_payment_can_be_refunded() {
        let now = Utc::now();
        let mut saga = started()
            .transitioned(SagaStatus::Processing, SagaStep::PaymentProcessing, now)
            .unwrap();
        saga.payment_id = Some(PaymentId::new(5));

        let refunded = saga
            .transitioned(SagaStatus::Refunded, SagaStep::PaymentRefunded, now)
            .unwrap();
        assert_eq!(refunded.payment_id, Some(PaymentId::new(5)));
        assert!(refunded.status.is_terminal());
    }
}

mod terminal_states {
    use super::*;

    #[test]
    fn terminal_states_reject_every_transition() {
        let now = Utc::now();
        for terminal in SagaStatus::ALL.into_iter().filter(SagaStatus::is_terminal) {
            let mut saga = started();
            saga.status = terminal;

            for next in SagaStatus::ALL {
                let err = saga
                    .transitioned(next, SagaStep::Compensating, now)
                    .unwrap_err();
                assert_eq!(
                    err,
                    DomainError::InvalidTransition {
                        from: terminal,
                        to: next
                    }
                );
            }
        }
    }

    #[test]
    fn completed_saga_cannot_be_compensated() {
        let now = Utc::now();
        let completed = started()
            .transitioned(SagaStatus::Processing, SagaStep::PaymentProcessing, now)
            .and_then(|s| s.transitioned(SagaStatus::Completed, SagaStep::PaymentCompleted, now))
            .unwrap();

        assert!(!completed.status.can_compensate());
        assert!(
            completed
                .transitioned(SagaStatus::Compensating, SagaStep::Compensating, now)
                .is_err()
        );
    }

    #[test]
    fn stale_check_uses_last_update() {
        let saga = started();
        assert!(saga.is_stale(saga.updated_at + Duration::seconds(1)));
        assert!(!saga.is_stale(saga.updated_at));
    }
}
