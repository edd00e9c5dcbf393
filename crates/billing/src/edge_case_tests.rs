// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Pipeline
//!
//! Tests critical boundary conditions in:
//! - Signature verification (BF-S01 to BF-S05)
//! - Reference classification (BF-C01 to BF-C06)
//! - Retry backoff (BF-J01 to BF-J04)
//! - Billing period math (BF-P01 to BF-P05)
//! - Overage billing (BF-O01 to BF-O05)
//! - Template rendering (BF-T01 to BF-T03)
//! - Reminder dispatch guards (BF-N01 to BF-N05)

#[cfg(test)]
mod signature_tests {
    use crate::signature::{self, SignatureBlock};
    use serde_json::json;

    fn event_data() -> serde_json::Value {
        json!({
            "transaction": {
                "id": "txn_01",
                "amount_in_cents": 5990000,
                "status": "APPROVED"
            }
        })
    }

    fn properties() -> Vec<String> {
        vec![
            "transaction.id".into(),
            "transaction.status".into(),
            "transaction.amount_in_cents".into(),
        ]
    }

    // =========================================================================
    // BF-S01: checksum over identical inputs is stable
    // =========================================================================
    #[test]
    fn test_checksum_deterministic() {
        let a = signature::compute_checksum(&event_data(), &properties(), 1700000000, "secret");
        let b = signature::compute_checksum(&event_data(), &properties(), 1700000000, "secret");
        assert_eq!(a, b);
    }

    // =========================================================================
    // BF-S02: tampering with any covered property changes the checksum
    // =========================================================================
    #[test]
    fn test_tampered_amount_rejected() {
        let checksum =
            signature::compute_checksum(&event_data(), &properties(), 1700000000, "secret");
        let mut tampered = event_data();
        tampered["transaction"]["amount_in_cents"] = json!(100);

        let block = SignatureBlock {
            checksum,
            properties: properties(),
        };
        let err = signature::verify(&tampered, &block, 1700000000, "secret", None).unwrap_err();
        assert!(matches!(err, crate::BillingError::InvalidSignature(_)));
    }

    // =========================================================================
    // BF-S03: header checksum wins over the body checksum
    // =========================================================================
    #[test]
    fn test_header_checksum_is_canonical() {
        let good = signature::compute_checksum(&event_data(), &properties(), 1700000000, "secret");
        let block = SignatureBlock {
            checksum: "ffff".repeat(16),
            properties: properties(),
        };
        let canonical =
            signature::verify(&event_data(), &block, 1700000000, "secret", Some(&good)).unwrap();
        assert_eq!(canonical, good);
    }

    // =========================================================================
    // BF-S04: checksum comparison ignores hex case
    // =========================================================================
    #[test]
    fn test_checksum_case_insensitive() {
        let good = signature::compute_checksum(&event_data(), &properties(), 1700000000, "secret");
        let block = SignatureBlock {
            checksum: good.to_uppercase(),
            properties: properties(),
        };
        assert!(signature::verify(&event_data(), &block, 1700000000, "secret", None).is_ok());
    }

    // =========================================================================
    // BF-S05: a missing covered property contributes an empty string,
    // it does not error
    // =========================================================================
    #[test]
    fn test_missing_property_renders_empty() {
        let props = vec!["transaction.id".into(), "transaction.ghost".into()];
        let with_missing =
            signature::compute_checksum(&event_data(), &props, 1700000000, "secret");
        let only_id = signature::compute_checksum(
            &event_data(),
            &["transaction.id".to_string()],
            1700000000,
            "secret",
        );
        assert_eq!(with_missing, only_id);
    }
}

#[cfg(test)]
mod reference_tests {
    use crate::reference::{subscription_reference, PaymentReference};
    use uuid::Uuid;

    // =========================================================================
    // BF-C01: round-trip of a reference we minted ourselves
    // =========================================================================
    #[test]
    fn test_minted_reference_roundtrip() {
        let id = Uuid::new_v4();
        let reference = subscription_reference(id, 7);
        match PaymentReference::classify(&reference) {
            PaymentReference::Subscription {
                subscription_id,
                cycle,
            } => {
                assert_eq!(subscription_id, id);
                assert_eq!(cycle, Some(7));
            }
            other => panic!("expected subscription, got {:?}", other),
        }
    }

    // =========================================================================
    // BF-C02: SUB_ with a uuid but no cycle still classifies
    // =========================================================================
    #[test]
    fn test_subscription_without_cycle() {
        let id = Uuid::new_v4();
        match PaymentReference::classify(&format!("SUB_{}", id)) {
            PaymentReference::Subscription { cycle, .. } => assert_eq!(cycle, None),
            other => panic!("expected subscription, got {:?}", other),
        }
    }

    // =========================================================================
    // BF-C03: SUB_ with a malformed uuid is Unknown, not an error
    // =========================================================================
    #[test]
    fn test_malformed_uuid_is_unknown() {
        assert!(matches!(
            PaymentReference::classify("SUB_not-a-uuid_3"),
            PaymentReference::Unknown
        ));
        assert!(matches!(
            PaymentReference::classify("SUB_"),
            PaymentReference::Unknown
        ));
    }

    // =========================================================================
    // BF-C04: storefront prefix routes to forwarding
    // =========================================================================
    #[test]
    fn test_storefront_prefix() {
        assert!(matches!(
            PaymentReference::classify("SHOPIFY_order_1234"),
            PaymentReference::ExternalOrder { .. }
        ));
    }

    // =========================================================================
    // BF-C05: empty and garbage references are Unknown
    // =========================================================================
    #[test]
    fn test_garbage_is_unknown() {
        assert!(matches!(
            PaymentReference::classify(""),
            PaymentReference::Unknown
        ));
        assert!(matches!(
            PaymentReference::classify("hello world"),
            PaymentReference::Unknown
        ));
    }

    // =========================================================================
    // BF-C06: classification is total over multi-byte input
    // =========================================================================
    #[test]
    fn test_multibyte_input_does_not_panic() {
        assert!(matches!(
            PaymentReference::classify("SUB_ñññññññññññññññññññññññññññ_1"),
            PaymentReference::Unknown
        ));
    }
}

#[cfg(test)]
mod backoff_tests {
    use crate::jobs::retry_delay;
    use time::Duration;

    // =========================================================================
    // BF-J01: first retries follow the 5s doubling schedule
    // =========================================================================
    #[test]
    fn test_initial_schedule() {
        assert_eq!(retry_delay(0), Duration::seconds(5));
        assert_eq!(retry_delay(1), Duration::seconds(10));
        assert_eq!(retry_delay(2), Duration::seconds(20));
        assert_eq!(retry_delay(3), Duration::seconds(40));
    }

    // =========================================================================
    // BF-J02: the cap is exactly five minutes
    // =========================================================================
    #[test]
    fn test_cap() {
        assert_eq!(retry_delay(5), Duration::seconds(160));
        assert_eq!(retry_delay(6), Duration::seconds(300));
        assert_eq!(retry_delay(7), Duration::seconds(300));
    }

    // =========================================================================
    // BF-J03: absurd attempt counts cannot overflow the shift
    // =========================================================================
    #[test]
    fn test_extreme_attempts() {
        assert_eq!(retry_delay(i32::MAX), Duration::seconds(300));
        assert_eq!(retry_delay(-1), Duration::seconds(5));
    }

    // =========================================================================
    // BF-J04: delays never shrink as attempts grow
    // =========================================================================
    #[test]
    fn test_monotonic() {
        let mut prev = Duration::ZERO;
        for attempts in 0..20 {
            let d = retry_delay(attempts);
            assert!(d >= prev);
            prev = d;
        }
    }
}

#[cfg(test)]
mod period_tests {
    use crate::period::{add_interval, IntervalUnit};
    use time::macros::datetime;

    // =========================================================================
    // BF-P01: Jan 31 + 1 month clamps to the end of February
    // =========================================================================
    #[test]
    fn test_month_end_clamp_leap_year() {
        let start = datetime!(2024-01-31 12:00 UTC);
        assert_eq!(
            add_interval(start, IntervalUnit::Month, 1),
            datetime!(2024-02-29 12:00 UTC)
        );
    }

    // =========================================================================
    // BF-P02: same clamp in a common year
    // =========================================================================
    #[test]
    fn test_month_end_clamp_common_year() {
        let start = datetime!(2023-01-31 12:00 UTC);
        assert_eq!(
            add_interval(start, IntervalUnit::Month, 1),
            datetime!(2023-02-28 12:00 UTC)
        );
    }

    // =========================================================================
    // BF-P03: week intervals are exact day counts
    // =========================================================================
    #[test]
    fn test_weeks_are_exact() {
        let start = datetime!(2024-03-01 00:00 UTC);
        assert_eq!(
            add_interval(start, IntervalUnit::Week, 2),
            datetime!(2024-03-15 00:00 UTC)
        );
    }

    // =========================================================================
    // BF-P04: adding a year to Feb 29 lands on Feb 28
    // =========================================================================
    #[test]
    fn test_leap_day_year_add() {
        let start = datetime!(2024-02-29 00:00 UTC);
        assert_eq!(
            add_interval(start, IntervalUnit::Year, 1),
            datetime!(2025-02-28 00:00 UTC)
        );
    }

    // =========================================================================
    // BF-P05: december wraps the year
    // =========================================================================
    #[test]
    fn test_year_wrap() {
        let start = datetime!(2024-12-15 00:00 UTC);
        assert_eq!(
            add_interval(start, IntervalUnit::Month, 1),
            datetime!(2025-01-15 00:00 UTC)
        );
    }
}

#[cfg(test)]
mod overage_tests {
    use crate::metering::metered_overage;

    // =========================================================================
    // BF-O01: crossing the allowance bills only the excess
    // =========================================================================
    #[test]
    fn test_crossing_allowance() {
        // allowance 100, counter 80 -> 110
        assert_eq!(metered_overage(80, 110, 100), 10);
    }

    // =========================================================================
    // BF-O02: increments entirely above the allowance bill in full
    // =========================================================================
    #[test]
    fn test_above_allowance() {
        assert_eq!(metered_overage(110, 115, 100), 5);
    }

    // =========================================================================
    // BF-O03: landing exactly on the allowance bills nothing
    // =========================================================================
    #[test]
    fn test_exact_boundary() {
        assert_eq!(metered_overage(95, 100, 100), 0);
        assert_eq!(metered_overage(100, 101, 100), 1);
    }

    // =========================================================================
    // BF-O04: zero allowance bills everything
    // =========================================================================
    #[test]
    fn test_zero_allowance() {
        assert_eq!(metered_overage(0, 7, 0), 7);
    }

    // =========================================================================
    // BF-O05: splitting an increment bills the same as taking it whole
    // =========================================================================
    #[test]
    fn test_split_equals_whole() {
        let whole = metered_overage(90, 130, 100);
        let split = metered_overage(90, 110, 100) + metered_overage(110, 130, 100);
        assert_eq!(whole, split);
        assert_eq!(whole, 30);
    }
}

#[cfg(test)]
mod rendering_tests {
    use crate::notifications::render_template;
    use crate::subscriptions::{BillingContext, CustomerRecord, PlanRecord, SubscriptionRecord};
    use serde_json::json;
    use time::macros::datetime;
    use uuid::Uuid;

    fn context() -> BillingContext {
        BillingContext {
            subscription: SubscriptionRecord {
                id: Uuid::nil(),
                customer_id: Uuid::nil(),
                plan_id: Uuid::nil(),
                status: "ACTIVE".into(),
                current_cycle: 2,
                current_period_start_at: datetime!(2024-05-01 00:00 UTC),
                current_period_end_at: datetime!(2024-06-01 00:00 UTC),
                canceled_at: None,
                created_at: datetime!(2024-05-01 00:00 UTC),
                updated_at: datetime!(2024-05-01 00:00 UTC),
            },
            customer: CustomerRecord {
                id: Uuid::nil(),
                name: "Luis".into(),
                email: None,
                phone: None,
                extensions: json!({}),
                created_at: datetime!(2024-05-01 00:00 UTC),
                updated_at: datetime!(2024-05-01 00:00 UTC),
            },
            plan: PlanRecord {
                id: Uuid::nil(),
                name: "Basic".into(),
                amount_in_cents: 1000,
                currency: "COP".into(),
                interval_unit: "month".into(),
                interval_count: 1,
                collection_mode: "manual_link".into(),
                extensions: json!({}),
                created_at: datetime!(2024-05-01 00:00 UTC),
            },
        }
    }

    // =========================================================================
    // BF-T01: dates render as ISO-8601
    // =========================================================================
    #[test]
    fn test_dates_are_iso() {
        let out = render_template("{{subscription.current_period_end_at}}", &context(), None);
        assert_eq!(out, "2024-06-01T00:00:00Z");
    }

    // =========================================================================
    // BF-T02: null customer fields render as empty strings
    // =========================================================================
    #[test]
    fn test_null_fields_empty() {
        let out = render_template("<{{customer.email}}>", &context(), None);
        assert_eq!(out, "<>");
    }

    // =========================================================================
    // BF-T03: text without placeholders passes through untouched
    // =========================================================================
    #[test]
    fn test_plain_text_passthrough() {
        let input = "No placeholders here. {not one} {{}}";
        let out = render_template(input, &context(), None);
        assert_eq!(out, "No placeholders here. ");
    }
}

#[cfg(test)]
mod reminder_guard_tests {
    use crate::notifications::{reminder_guard, ReminderPayload, ReminderRule, Trigger};
    use crate::subscriptions::SubscriptionRecord;
    use time::macros::datetime;
    use uuid::Uuid;

    fn subscription() -> SubscriptionRecord {
        SubscriptionRecord {
            id: Uuid::nil(),
            customer_id: Uuid::nil(),
            plan_id: Uuid::nil(),
            status: "ACTIVE".into(),
            current_cycle: 4,
            current_period_start_at: datetime!(2024-05-01 00:00 UTC),
            current_period_end_at: datetime!(2024-06-01 00:00 UTC),
            canceled_at: None,
            created_at: datetime!(2024-05-01 00:00 UTC),
            updated_at: datetime!(2024-05-01 00:00 UTC),
        }
    }

    fn rule() -> ReminderRule {
        ReminderRule {
            id: Uuid::nil(),
            trigger_kind: Trigger::SubscriptionDue.as_str().into(),
            offsets_minutes: vec![-1440, 0],
            template: "{{customer.name}}".into(),
            require_status_in: None,
            skip_status_in: None,
            ensure_payment_link: false,
            enabled: true,
            created_at: datetime!(2024-05-01 00:00 UTC),
        }
    }

    fn payload(trigger: Trigger) -> ReminderPayload {
        ReminderPayload {
            rule_id: Uuid::nil(),
            subscription_id: Uuid::nil(),
            cycle: 4,
            anchor: "2024-06-01T00:00:00Z".into(),
            trigger: trigger.as_str().into(),
        }
    }

    // =========================================================================
    // BF-N01: a reminder for a cycle the subscription left is dropped
    // =========================================================================
    #[test]
    fn test_advanced_cycle_drops() {
        let mut sub = subscription();
        sub.current_cycle = 5;
        let reason = reminder_guard(&sub, &rule(), &payload(Trigger::SubscriptionDue), false);
        assert_eq!(reason, Some("cycle advanced"));
    }

    // =========================================================================
    // BF-N02: a due-date reminder whose anchor moved is dropped; rescheduling
    // replaces it, delivery does not chase the new date
    // =========================================================================
    #[test]
    fn test_moved_anchor_drops_due_reminders_only() {
        let mut sub = subscription();
        sub.current_period_end_at = datetime!(2024-06-15 00:00 UTC);
        let reason = reminder_guard(&sub, &rule(), &payload(Trigger::SubscriptionDue), false);
        assert_eq!(reason, Some("anchor changed"));

        // declined-payment reminders are anchored at schedule time, not at
        // the period end, so the moved period does not drop them
        let reason = reminder_guard(&sub, &rule(), &payload(Trigger::PaymentDeclined), false);
        assert_eq!(reason, None);
    }

    // =========================================================================
    // BF-N03: a cycle paid between scheduling and dispatch is dropped
    // =========================================================================
    #[test]
    fn test_paid_cycle_drops() {
        let reason = reminder_guard(
            &subscription(),
            &rule(),
            &payload(Trigger::SubscriptionDue),
            true,
        );
        assert_eq!(reason, Some("cycle already paid"));
    }

    // =========================================================================
    // BF-N04: require/skip status sets on the rule
    // =========================================================================
    #[test]
    fn test_status_conditions() {
        let mut r = rule();
        r.require_status_in = Some(vec!["PAST_DUE".into()]);
        let reason = reminder_guard(&subscription(), &r, &payload(Trigger::SubscriptionDue), false);
        assert_eq!(reason, Some("status not in required set"));

        let mut r = rule();
        r.skip_status_in = Some(vec!["ACTIVE".into(), "CANCELED".into()]);
        let reason = reminder_guard(&subscription(), &r, &payload(Trigger::SubscriptionDue), false);
        assert_eq!(reason, Some("status in skip set"));
    }

    // =========================================================================
    // BF-N05: current cycle, unchanged anchor, unpaid, no status conditions
    // passes every guard
    // =========================================================================
    #[test]
    fn test_current_reminder_passes() {
        let reason = reminder_guard(
            &subscription(),
            &rule(),
            &payload(Trigger::SubscriptionDue),
            false,
        );
        assert_eq!(reason, None);
    }
}
