// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Platform Fee Billing
//!
//! Tests boundary conditions and race conditions in:
//! - Invoice generation (FEE-G01 to FEE-G05)
//! - Attempt windows (FEE-W01 to FEE-W08)
//! - Concurrent claims (FEE-C01 to FEE-C04)
//! - Delinquency (FEE-D01 to FEE-D04)
//! - Status derivation (FEE-S01 to FEE-S03)
//! - Deferred event delivery (FEE-E01 to FEE-E04)

#[cfg(test)]
mod harness {
    use std::sync::Arc;

    use chrono::NaiveDate;
    use uuid::Uuid;

    use crate::events::BillingEventPublisher;
    use crate::repository::InMemoryFeeRepository;
    use crate::service::{FeeSchedule, PlatformFeeService};
    use crate::test_support::{FakeTransactionClient, RecordingPublisher};

    pub struct Billing {
        pub repo: Arc<InMemoryFeeRepository>,
        pub bank: Arc<FakeTransactionClient>,
        pub publisher: Arc<RecordingPublisher>,
        pub service: PlatformFeeService,
    }

    pub fn billing() -> Billing {
        billing_with(FeeSchedule::default())
    }

    pub fn billing_with(schedule: FeeSchedule) -> Billing {
        let repo = Arc::new(InMemoryFeeRepository::new());
        let bank = Arc::new(FakeTransactionClient::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let service = PlatformFeeService::new(
            repo.clone(),
            bank.clone(),
            BillingEventPublisher::new(publisher.clone(), "transfa.events"),
            schedule,
        );
        Billing {
            repo,
            bank,
            publisher,
            service,
        }
    }

    pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Personal users pay 500 NGN from 2023 on
    pub fn with_personal_users(billing: &Billing, count: usize) -> Vec<Uuid> {
        billing
            .repo
            .add_config("personal", 50_000, "NGN", date(2023, 1, 1));
        (0..count)
            .map(|_| {
                let id = Uuid::new_v4();
                billing.repo.add_user(id, "personal");
                id
            })
            .collect()
    }
}

#[cfg(test)]
mod generation_tests {
    use super::harness::*;
    use crate::models::InvoiceStatus;
    use crate::test_support::at;
    use uuid::Uuid;

    // =========================================================================
    // FEE-G01: Running generation twice creates nothing the second time
    // =========================================================================
    #[tokio::test]
    async fn test_generation_is_idempotent() {
        let b = billing();
        with_personal_users(&b, 3);

        let first = b.service.generate_monthly_invoices_at(at(2024, 1, 1, 0, 1)).await.unwrap();
        let second = b.service.generate_monthly_invoices_at(at(2024, 1, 15, 12, 0)).await.unwrap();

        assert_eq!(first.created, 3);
        assert_eq!(second.created, 0, "Same period must not be invoiced twice");
        assert_eq!(b.repo.invoices().len(), 3);
        assert_eq!(b.publisher.routing_keys().len(), 3, "Due events only for new rows");
    }

    // =========================================================================
    // FEE-G02: Users without a fee config are excluded, not guessed
    // =========================================================================
    #[tokio::test]
    async fn test_user_without_config_is_skipped() {
        let b = billing();
        with_personal_users(&b, 1);
        b.repo.add_user(Uuid::new_v4(), "merchant");

        let summary = b.service.generate_monthly_invoices_at(at(2024, 1, 1, 0, 1)).await.unwrap();
        assert_eq!(summary.created, 1);
        assert!(b.repo.invoices().iter().all(|i| i.user_type == "personal"));
    }

    // =========================================================================
    // FEE-G03: Latest effective config at or before period start wins
    // =========================================================================
    #[tokio::test]
    async fn test_latest_effective_config_is_used() {
        let b = billing();
        b.repo.add_config("merchant", 100_000, "NGN", date(2023, 1, 1));
        b.repo.add_config("merchant", 150_000, "NGN", date(2023, 11, 1));
        // Takes effect after the December period starts
        b.repo.add_config("merchant", 999_999, "NGN", date(2023, 12, 15));
        b.repo.add_user(Uuid::new_v4(), "merchant");

        b.service.generate_monthly_invoices_at(at(2024, 1, 1, 0, 1)).await.unwrap();
        assert_eq!(b.repo.invoices()[0].amount, 150_000);
    }

    // =========================================================================
    // FEE-G04: New invoices start pending with no attempts
    // =========================================================================
    #[tokio::test]
    async fn test_new_invoice_is_pending() {
        let b = billing();
        with_personal_users(&b, 1);
        b.service.generate_monthly_invoices_at(at(2024, 2, 1, 0, 1)).await.unwrap();

        let invoice = &b.repo.invoices()[0];
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        assert_eq!(invoice.retry_count, 0);
        assert!(invoice.last_attempt_at.is_none());
        assert_eq!(invoice.period_start, date(2024, 1, 1));
        assert_eq!(invoice.period_end, date(2024, 1, 31));
    }

    // =========================================================================
    // FEE-G05: Generation across a year boundary
    // =========================================================================
    #[tokio::test]
    async fn test_january_run_bills_previous_december() {
        let b = billing();
        with_personal_users(&b, 1);
        let summary = b.service.generate_monthly_invoices_at(at(2025, 1, 1, 0, 0)).await.unwrap();
        assert_eq!(summary.period_start, date(2024, 12, 1));
        assert_eq!(summary.period_end, date(2024, 12, 31));
    }
}

#[cfg(test)]
mod window_tests {
    use super::harness::*;
    use crate::error::BillingError;
    use crate::models::InvoiceStatus;
    use crate::service::{ChargeOutcome, FeeSchedule};
    use crate::test_support::{at, sample_invoice};
    use chrono::Duration;
    use tokio_util::sync::CancellationToken;

    // =========================================================================
    // FEE-W01: Due 2024-01-01T00:05Z - a run on day 1 attempts
    // =========================================================================
    #[tokio::test]
    async fn test_day_one_run_attempts() {
        let b = billing();
        let invoice = sample_invoice();
        b.bank.decline(invoice.user_id, "insufficient funds");
        b.repo.insert_invoice(invoice.clone());

        b.service.run_charge_attempts_at(at(2024, 1, 1, 0, 10)).await.unwrap();
        let summary = b.service.run_charge_attempts_at(at(2024, 1, 2, 0, 10)).await.unwrap();

        assert_eq!(summary.failed, 1, "Day 1 is an allowed offset");
        assert_eq!(b.bank.debits().len(), 2);
    }

    // =========================================================================
    // FEE-W02: Day 2 is not an allowed offset
    // =========================================================================
    #[tokio::test]
    async fn test_day_two_run_skips() {
        let b = billing();
        let invoice = sample_invoice();
        b.bank.decline(invoice.user_id, "insufficient funds");
        b.repo.insert_invoice(invoice);

        let summary = b.service.run_charge_attempts_at(at(2024, 1, 3, 0, 10)).await.unwrap();
        assert_eq!(summary.candidates, 1);
        assert_eq!(summary.outside_window, 1);
        assert!(b.bank.debits().is_empty());
    }

    // =========================================================================
    // FEE-W03: Repeated runs inside one window debit once
    // =========================================================================
    #[tokio::test]
    async fn test_one_attempt_per_window() {
        let b = billing();
        let invoice = sample_invoice();
        b.bank.decline(invoice.user_id, "insufficient funds");
        b.repo.insert_invoice(invoice);

        for hour in [0, 6, 12, 23] {
            b.service.run_charge_attempts_at(at(2024, 1, 4, hour, 30)).await.unwrap();
        }
        assert_eq!(b.bank.debits().len(), 1, "Day 3 window allows exactly one debit");
    }

    // =========================================================================
    // FEE-W04: Full cadence yields five attempts, then delinquency
    // =========================================================================
    #[tokio::test]
    async fn test_full_cadence_then_delinquent() {
        let b = billing();
        let invoice = sample_invoice();
        b.bank.decline(invoice.user_id, "insufficient funds");
        b.repo.insert_invoice(invoice);

        for day in 1..=8 {
            b.service.run_charge_attempts_at(at(2024, 1, day, 0, 4)).await.unwrap();
            b.service.run_charge_attempts_at(at(2024, 1, day, 0, 6)).await.unwrap();
        }
        // Offsets 0,1,3,5,7 after due_at; the 00:04 run on day 1 is before due
        assert_eq!(b.bank.debits().len(), 5);

        let marked = b.service.mark_delinquent_at(at(2024, 1, 8, 0, 6)).await.unwrap();
        assert_eq!(marked.marked, 1);
        assert_eq!(b.repo.invoices()[0].status, InvoiceStatus::Delinquent);
        assert_eq!(b.repo.invoices()[0].retry_count, 5);
    }

    // =========================================================================
    // FEE-W05: Declined then recovered funds pays on the next window
    // =========================================================================
    #[tokio::test]
    async fn test_recovery_on_later_window() {
        let b = billing();
        let invoice = sample_invoice();
        b.bank.decline(invoice.user_id, "insufficient funds");
        b.repo.insert_invoice(invoice.clone());

        b.service.run_charge_attempts_at(at(2024, 1, 1, 0, 10)).await.unwrap();
        b.bank.approve(invoice.user_id);
        let summary = b.service.run_charge_attempts_at(at(2024, 1, 2, 0, 10)).await.unwrap();

        assert_eq!(summary.paid, 1);
        assert_eq!(b.repo.invoices()[0].status, InvoiceStatus::Paid);
        assert_eq!(b.repo.invoices()[0].failure_reason, None);
        assert_eq!(
            b.publisher.routing_keys(),
            vec!["platform_fee.failed", "platform_fee.paid"]
        );
    }

    // =========================================================================
    // FEE-W06: A batch smaller than the declined backlog still reaches every
    // invoice on every allowed offset
    // =========================================================================
    #[tokio::test]
    async fn test_small_batches_reach_every_invoice() {
        let b = billing_with(FeeSchedule {
            charge_batch_size: 2,
            ..FeeSchedule::default()
        });
        let invoices: Vec<_> = (0..3).map(|_| sample_invoice()).collect();
        for invoice in &invoices {
            b.bank.decline(invoice.user_id, "insufficient funds");
            b.repo.insert_invoice(invoice.clone());
        }

        let first = b.service.run_charge_attempts_at(at(2024, 1, 1, 0, 10)).await.unwrap();
        assert_eq!(first.candidates, 3);
        assert_eq!(first.failed, 3);

        for day in 1..=8 {
            for (hour, min) in [(0, 4), (0, 10), (9, 0), (18, 0)] {
                b.service.run_charge_attempts_at(at(2024, 1, day, hour, min)).await.unwrap();
            }
        }

        let debits = b.bank.debits();
        for invoice in &invoices {
            let attempts = debits.iter().filter(|(_, _, id)| *id == invoice.id).count();
            assert_eq!(attempts, 5, "Invoice {} missed an allowed offset", invoice.id);
        }

        let marked = b.service.mark_delinquent_at(at(2024, 1, 8, 0, 6)).await.unwrap();
        assert_eq!(marked.marked, 3);
        assert!(b.repo.invoices().iter().all(|i| i.retry_count == 5));
    }

    // =========================================================================
    // FEE-W07: Cancellation stops a charge cycle between invoices
    // =========================================================================
    #[tokio::test]
    async fn test_cancellation_stops_between_invoices() {
        let b = billing();
        for _ in 0..3 {
            b.repo.insert_invoice(sample_invoice());
        }

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let summary = b.service.run_charge_cycle(at(2024, 1, 1, 0, 10), &cancelled).await.unwrap();
        assert!(summary.interrupted);
        assert!(b.bank.debits().is_empty());

        let cancel = CancellationToken::new();
        b.bank.cancel_on_debit(cancel.clone());
        let summary = b.service.run_charge_cycle(at(2024, 1, 1, 0, 20), &cancel).await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.paid, 1, "The in-flight invoice finishes before the cycle stops");
        assert_eq!(b.bank.debits().len(), 1);

        let summary = b.service.run_charge_attempts_at(at(2024, 1, 1, 0, 30)).await.unwrap();
        assert!(!summary.interrupted);
        assert_eq!(summary.paid, 2);
    }

    // =========================================================================
    // FEE-W08: Manual charges honor [due_at, grace_until]
    // =========================================================================
    #[tokio::test]
    async fn test_manual_charge_bounded_by_grace() {
        let b = billing();
        let invoice = sample_invoice();
        b.bank.decline(invoice.user_id, "insufficient funds");
        b.repo.insert_invoice(invoice.clone());

        for now in [
            invoice.due_at - Duration::minutes(1),
            invoice.grace_until + Duration::seconds(1),
        ] {
            let err = b.service.charge_invoice_at(invoice.id, now).await.unwrap_err();
            assert!(matches!(err, BillingError::InvalidInput(_)), "{now}: {err}");
        }
        assert!(b.bank.debits().is_empty());
        assert_eq!(b.repo.invoices()[0].retry_count, 0);

        let outcome = b.service.charge_invoice_at(invoice.id, invoice.due_at).await.unwrap();
        assert!(matches!(outcome, ChargeOutcome::Failed { .. }));
        let outcome = b.service.charge_invoice_at(invoice.id, invoice.grace_until).await.unwrap();
        assert!(matches!(outcome, ChargeOutcome::Failed { .. }));
        assert_eq!(b.bank.debits().len(), 2);
    }
}

#[cfg(test)]
mod claim_tests {
    use std::sync::Arc;

    use super::harness::*;
    use crate::models::{AttemptStatus, NewAttempt};
    use crate::repository::FeeRepository;
    use crate::service::ChargeOutcome;
    use crate::test_support::{at, sample_invoice};
    use tokio::sync::Barrier;

    // =========================================================================
    // FEE-C01: Double claim in the same window returns the row once
    // =========================================================================
    #[tokio::test]
    async fn test_double_claim_returns_once() {
        let b = billing();
        let invoice = sample_invoice();
        b.repo.insert_invoice(invoice.clone());
        let now = at(2024, 1, 1, 0, 10);
        let window_start = at(2024, 1, 1, 0, 0);

        let first = b.repo.claim_invoice_attempt(invoice.id, now, window_start).await.unwrap();
        let second = b.repo.claim_invoice_attempt(invoice.id, now, window_start).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
    }

    // =========================================================================
    // FEE-C02: Ten concurrent schedulers debit once
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_schedulers_debit_once() {
        let b = billing();
        let invoice = sample_invoice();
        b.repo.insert_invoice(invoice.clone());
        let service = Arc::new(b.service.clone());
        let barrier = Arc::new(Barrier::new(10));

        let mut handles = vec![];
        for _ in 0..10 {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service.run_charge_attempts_at(at(2024, 1, 1, 0, 10)).await.unwrap()
            }));
        }

        let mut paid = 0;
        for handle in handles {
            paid += handle.await.unwrap().paid;
        }

        assert_eq!(paid, 1, "Exactly one scheduler wins the window");
        assert_eq!(b.bank.debits().len(), 1);
        assert_eq!(b.repo.attempts().len(), 1);
    }

    // =========================================================================
    // FEE-C03: A second success attempt row is refused
    // =========================================================================
    #[tokio::test]
    async fn test_at_most_one_success_attempt() {
        let b = billing();
        let invoice = sample_invoice();
        b.repo.insert_invoice(invoice.clone());
        let attempt = NewAttempt {
            invoice_id: invoice.id,
            attempted_at: at(2024, 1, 1, 0, 10),
            amount: invoice.amount,
            status: AttemptStatus::Success,
            failure_reason: None,
            provider_reference: Some("txn_1".to_string()),
        };

        b.repo.insert_attempt(&attempt).await.unwrap();
        assert!(b.repo.insert_attempt(&attempt).await.is_err());
    }

    // =========================================================================
    // FEE-C04: Success row without paid status blocks further claims
    // =========================================================================
    #[tokio::test]
    async fn test_success_row_blocks_claims() {
        let b = billing();
        let invoice = sample_invoice();
        b.repo.insert_invoice(invoice.clone());
        b.repo
            .insert_attempt(&NewAttempt {
                invoice_id: invoice.id,
                attempted_at: at(2024, 1, 1, 0, 10),
                amount: invoice.amount,
                status: AttemptStatus::Success,
                failure_reason: None,
                provider_reference: Some("txn_crash".to_string()),
            })
            .await
            .unwrap();

        let outcome = b.service.charge_invoice_at(invoice.id, at(2024, 1, 2, 0, 10)).await.unwrap();
        assert_eq!(outcome, ChargeOutcome::NotClaimed { invoice_id: invoice.id });
        assert!(b.bank.debits().is_empty());

        let summary = b.service.run_charge_attempts_at(at(2024, 1, 2, 0, 10)).await.unwrap();
        assert_eq!(summary.candidates, 0);
    }
}

#[cfg(test)]
mod delinquency_tests {
    use super::harness::*;
    use crate::models::{AttemptStatus, InvoiceStatus, NewAttempt};
    use crate::repository::FeeRepository;
    use crate::test_support::{at, sample_invoice};

    // =========================================================================
    // FEE-D01: Only grace-expired open invoices are touched
    // =========================================================================
    #[tokio::test]
    async fn test_only_expired_open_invoices() {
        let b = billing();
        let expired = sample_invoice();
        let mut paid = sample_invoice();
        paid.status = InvoiceStatus::Paid;
        let mut waived = sample_invoice();
        waived.status = InvoiceStatus::Waived;
        let mut current = sample_invoice();
        current.grace_until = at(2024, 2, 8, 0, 5);
        for invoice in [&expired, &paid, &waived, &current] {
            b.repo.insert_invoice(invoice.clone());
        }

        let summary = b.service.mark_delinquent_at(at(2024, 1, 9, 0, 0)).await.unwrap();
        assert_eq!(summary.marked, 1);

        let statuses: Vec<_> = b.repo.invoices().iter().map(|i| i.status).collect();
        assert_eq!(
            statuses,
            vec![
                InvoiceStatus::Delinquent,
                InvoiceStatus::Paid,
                InvoiceStatus::Waived,
                InvoiceStatus::Pending
            ]
        );
        assert_eq!(b.publisher.routing_keys(), vec!["platform_fee.delinquent"]);
    }

    // =========================================================================
    // FEE-D02: grace_until == now is still inside grace
    // =========================================================================
    #[tokio::test]
    async fn test_grace_boundary_not_delinquent() {
        let b = billing();
        let invoice = sample_invoice();
        b.repo.insert_invoice(invoice.clone());

        let summary = b.service.mark_delinquent_at(invoice.grace_until).await.unwrap();
        assert_eq!(summary.marked, 0);
    }

    // =========================================================================
    // FEE-D03: Unpaid invoice with a success attempt is never delinquent
    // =========================================================================
    #[tokio::test]
    async fn test_success_attempt_prevents_delinquency() {
        let b = billing();
        let invoice = sample_invoice();
        b.repo.insert_invoice(invoice.clone());
        b.repo
            .insert_attempt(&NewAttempt {
                invoice_id: invoice.id,
                attempted_at: at(2024, 1, 1, 0, 10),
                amount: invoice.amount,
                status: AttemptStatus::Success,
                failure_reason: None,
                provider_reference: Some("txn".to_string()),
            })
            .await
            .unwrap();

        let summary = b.service.mark_delinquent_at(at(2024, 2, 1, 0, 0)).await.unwrap();
        assert_eq!(summary.marked, 0);
    }

    // =========================================================================
    // FEE-D04: Delinquent invoices are never attempted again
    // =========================================================================
    #[tokio::test]
    async fn test_delinquent_is_terminal_for_attempts() {
        let b = billing();
        let mut invoice = sample_invoice();
        invoice.status = InvoiceStatus::Delinquent;
        b.repo.insert_invoice(invoice.clone());

        let summary = b.service.run_charge_attempts_at(at(2024, 1, 6, 0, 10)).await.unwrap();
        assert_eq!(summary.candidates, 0);
        let outcome = b.service.charge_invoice_at(invoice.id, at(2024, 1, 6, 0, 10)).await.unwrap();
        assert!(matches!(outcome, crate::service::ChargeOutcome::NotClaimed { .. }));
    }
}

#[cfg(test)]
mod status_tests {
    use super::harness::*;
    use crate::models::{AttemptStatus, InvoiceStatus, NewAttempt};
    use crate::repository::FeeRepository;
    use crate::test_support::{at, sample_invoice};
    use uuid::Uuid;

    // =========================================================================
    // FEE-S01: Success row heals a failed invoice to paid on read
    // =========================================================================
    #[tokio::test]
    async fn test_self_healing_read() {
        let b = billing();
        let mut invoice = sample_invoice();
        invoice.status = InvoiceStatus::Failed;
        b.repo.insert_invoice(invoice.clone());
        b.repo
            .insert_attempt(&NewAttempt {
                invoice_id: invoice.id,
                attempted_at: at(2024, 1, 3, 0, 10),
                amount: invoice.amount,
                status: AttemptStatus::Success,
                failure_reason: None,
                provider_reference: Some("txn".to_string()),
            })
            .await
            .unwrap();

        let status = b
            .service
            .get_status_by_user_id_at(invoice.user_id, at(2024, 1, 20, 0, 0))
            .await
            .unwrap();
        let latest = status.latest_invoice.unwrap();
        assert_eq!(latest.status, InvoiceStatus::Paid);
        assert_eq!(latest.stored_status, InvoiceStatus::Failed);
        assert!(!status.is_delinquent);

        let history = b.service.list_invoices_for_user(invoice.user_id, None).await.unwrap();
        assert_eq!(history[0].status, InvoiceStatus::Paid);
    }

    // =========================================================================
    // FEE-S02: Latest invoice decides the status
    // =========================================================================
    #[tokio::test]
    async fn test_latest_invoice_wins() {
        let b = billing();
        let user_id = Uuid::new_v4();
        let mut old = sample_invoice();
        old.user_id = user_id;
        old.status = InvoiceStatus::Delinquent;
        old.period_start = date(2023, 11, 1);
        let mut latest = sample_invoice();
        latest.user_id = user_id;
        b.repo.insert_invoice(old);
        b.repo.insert_invoice(latest.clone());

        let status = b
            .service
            .get_status_by_user_id_at(user_id, at(2024, 1, 2, 0, 0))
            .await
            .unwrap();
        assert_eq!(status.latest_invoice.unwrap().id, latest.id);
        assert!(status.is_within_grace);
        assert!(!status.is_delinquent);
    }

    // =========================================================================
    // FEE-S03: Unknown user has a clean status
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_user() {
        let b = billing();
        let status = b.service.get_status_by_user_id(Uuid::new_v4()).await.unwrap();
        assert!(status.latest_invoice.is_none());
        assert!(!status.is_delinquent);
    }
}

#[cfg(test)]
mod deferred_delivery_tests {
    use std::sync::Arc;

    use super::harness::*;
    use crate::events::BillingEventPublisher;
    use crate::repository::InMemoryFeeRepository;
    use crate::service::{FeeSchedule, PlatformFeeService};
    use crate::test_support::{at, sample_invoice, FakeTransactionClient, RecordingPublisher};
    use transfa_shared::{DispatcherConfig, InMemoryOutboxStore, OutboxDispatcher, OutboxStatus};

    struct OutboxBilling {
        store: Arc<InMemoryOutboxStore>,
        repo: Arc<InMemoryFeeRepository>,
        direct: Arc<RecordingPublisher>,
        service: PlatformFeeService,
    }

    fn outbox_billing() -> OutboxBilling {
        let store = Arc::new(InMemoryOutboxStore::new());
        let repo = Arc::new(InMemoryFeeRepository::with_outbox(store.clone(), "transfa.events"));
        let direct = Arc::new(RecordingPublisher::new());
        let service = PlatformFeeService::new(
            repo.clone(),
            Arc::new(FakeTransactionClient::new()),
            BillingEventPublisher::new(direct.clone(), "transfa.events"),
            FeeSchedule::default(),
        );
        OutboxBilling {
            store,
            repo,
            direct,
            service,
        }
    }

    // =========================================================================
    // FEE-E01: Billing transitions land in the outbox, not the broker
    // =========================================================================
    #[tokio::test]
    async fn test_transitions_are_queued() {
        let b = outbox_billing();
        let invoice = sample_invoice();
        b.repo.insert_invoice(invoice.clone());

        b.service.run_charge_attempts_at(at(2024, 1, 1, 0, 10)).await.unwrap();

        let rows = b.store.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].routing_key, "platform_fee.paid");
        assert_eq!(rows[0].status, OutboxStatus::Pending);
        assert_eq!(rows[0].payload["provider_reference"], format!("txn_{}", invoice.id.simple()));
        assert!(b.direct.routing_keys().is_empty(), "Outbox rows replace direct publishes");
    }

    // =========================================================================
    // FEE-E02: Dispatcher drains queued billing events to the broker
    // =========================================================================
    #[tokio::test]
    async fn test_dispatcher_drains_billing_events() {
        let b = outbox_billing();
        b.repo.add_config("personal", 50_000, "NGN", date(2023, 1, 1));
        b.repo.add_user(uuid::Uuid::new_v4(), "personal");
        b.service.generate_monthly_invoices_at(at(2024, 1, 1, 0, 1)).await.unwrap();

        let broker = Arc::new(RecordingPublisher::new());
        let dispatcher = OutboxDispatcher::new(b.store.clone(), broker.clone(), DispatcherConfig::default());
        let summary = dispatcher.flush_once().await.unwrap();

        assert_eq!(summary.published, 1);
        assert_eq!(broker.routing_keys(), vec!["platform_fee.due"]);
        assert_eq!(b.store.snapshot()[0].status, OutboxStatus::Published);
    }

    // =========================================================================
    // FEE-E03: A rejected outbox write rolls back generation; the rerun
    // creates the invoices and their due events together
    // =========================================================================
    #[tokio::test]
    async fn test_generation_and_due_events_commit_together() {
        let b = outbox_billing();
        with_personal_users_in(&b.repo, 2);

        b.store.set_unavailable(true);
        assert!(b.service.generate_monthly_invoices_at(at(2024, 1, 1, 0, 1)).await.is_err());
        assert!(b.repo.invoices().is_empty(), "No invoice without its due event");
        assert!(b.store.snapshot().is_empty());

        b.store.set_unavailable(false);
        let summary = b.service.generate_monthly_invoices_at(at(2024, 1, 1, 0, 2)).await.unwrap();
        assert_eq!(summary.created, 2);

        // Broker down for the first flush; rows stay queued for the next one
        let dispatcher = OutboxDispatcher::new(
            b.store.clone(),
            Arc::new(RecordingPublisher::failing()),
            DispatcherConfig::default(),
        );
        assert_eq!(dispatcher.flush_once().await.unwrap().published, 0);

        let broker = Arc::new(RecordingPublisher::new());
        let dispatcher = OutboxDispatcher::new(b.store.clone(), broker.clone(), DispatcherConfig::default());
        let later = chrono::Utc::now() + chrono::Duration::minutes(10);
        assert_eq!(dispatcher.flush_once_at(later).await.unwrap().published, 2);

        let mut delivered: Vec<String> = broker
            .bodies("platform_fee.due")
            .iter()
            .map(|body| body["invoice_id"].as_str().unwrap().to_string())
            .collect();
        let mut created: Vec<String> = b.repo.invoices().iter().map(|i| i.id.to_string()).collect();
        delivered.sort();
        created.sort();
        assert_eq!(delivered, created);
    }

    // =========================================================================
    // FEE-E04: A rejected outbox write leaves the failed transition unapplied
    // =========================================================================
    #[tokio::test]
    async fn test_failed_transition_needs_its_event() {
        let b = outbox_billing();
        let invoice = sample_invoice();
        b.repo.insert_invoice(invoice.clone());

        b.store.set_unavailable(true);
        let marked = b.service.mark_delinquent_at(at(2024, 1, 9, 0, 0)).await;
        assert!(marked.is_err());
        assert_eq!(b.repo.invoices()[0].status, crate::models::InvoiceStatus::Pending);

        b.store.set_unavailable(false);
        let marked = b.service.mark_delinquent_at(at(2024, 1, 9, 0, 1)).await.unwrap();
        assert_eq!(marked.marked, 1);
        let rows = b.store.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].routing_key, "platform_fee.delinquent");
        assert_eq!(rows[0].payload["idempotency_key"], format!("{}:delinquent", invoice.id));
    }

    fn with_personal_users_in(repo: &InMemoryFeeRepository, count: usize) {
        repo.add_config("personal", 50_000, "NGN", date(2023, 1, 1));
        for _ in 0..count {
            repo.add_user(uuid::Uuid::new_v4(), "personal");
        }
    }
}
