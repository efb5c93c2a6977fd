//! Scale state machine, free of any I/O.
//!
//! `Inactive -> Activating` on an activation signal, `Activating -> Active` once enough
//! replicas are ready, and `Active -> Inactive` once a zero decision has held for the grace
//! period. At most one transition happens per pass.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{
    config::AutoscalerConfig,
    decider::Decision,
    types::{PodAutoscalerStatus, Reachability, RoutingMode, ScaleStatus},
};

/// Everything a pass observed about one PodAutoscaler.
#[derive(Clone, Copy, Debug)]
pub struct Observation<'a> {
    pub status: Option<&'a PodAutoscalerStatus>,
    pub decision: Option<&'a Decision>,
    pub reachability: Reachability,
    pub ready_replicas: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Plan {
    pub scale_status: ScaleStatus,
    pub routing_mode: RoutingMode,
    /// Replica count to set on the scale target.
    pub desired_scale: i32,
    /// Start of the zero-decision period, while the grace period is running.
    pub idle_since: Option<DateTime<Utc>>,
    /// Set while the scale-down waits for the grace period to expire.
    pub requeue_after: Option<Duration>,
}

/// Only active revisions receive traffic directly.
pub fn routing_mode_for(status: ScaleStatus) -> RoutingMode {
    match status {
        ScaleStatus::Active => RoutingMode::Serve,
        ScaleStatus::Activating | ScaleStatus::Inactive => RoutingMode::Proxy,
    }
}

pub fn plan(observed: &Observation, config: &AutoscalerConfig, now: DateTime<Utc>) -> Plan {
    // A PodAutoscaler without status has never been scaled and starts by activating.
    let current = observed
        .status
        .and_then(|status| status.scale_status)
        .unwrap_or(ScaleStatus::Activating);
    let previous_scale = observed
        .status
        .and_then(|status| status.desired_scale)
        .unwrap_or(0);
    let desired = observed.decision.map(|decision| decision.desired_scale.max(0));
    let pending = observed
        .decision
        .map_or(false, |decision| decision.pending_requests > 0);
    let activation_signal = desired.map_or(false, |desired| desired > 0)
        || (pending && observed.reachability != Reachability::Unreachable);
    // Scale to request while capacity comes up. Without a decision, keep what was asked before.
    let scale_up = desired.unwrap_or(previous_scale).max(1);

    let (scale_status, desired_scale, idle_since, requeue_after) = match current {
        ScaleStatus::Inactive if activation_signal => {
            (ScaleStatus::Activating, scale_up, None, None)
        }
        ScaleStatus::Inactive => (ScaleStatus::Inactive, 0, None, None),
        ScaleStatus::Activating
            if observed.ready_replicas >= config.activation_min_ready_replicas =>
        {
            (ScaleStatus::Active, scale_up, None, None)
        }
        ScaleStatus::Activating => (ScaleStatus::Activating, scale_up, None, None),
        ScaleStatus::Active => match desired {
            Some(0) if config.enable_scale_to_zero => {
                let idle_since = observed
                    .status
                    .and_then(|status| status.idle_since.as_ref())
                    .map_or(now, |time| time.0);
                // Validation caps the grace period at one day.
                let grace = chrono::Duration::from_std(config.scale_to_zero_grace_period())
                    .unwrap_or_else(|_| chrono::Duration::days(1));
                let deadline = idle_since + grace;
                if now >= deadline {
                    (ScaleStatus::Inactive, 0, None, None)
                } else {
                    // Hold the current capacity until the zero decision has proven stable.
                    let remaining = (deadline - now).to_std().unwrap_or_default();
                    (
                        ScaleStatus::Active,
                        previous_scale.max(1),
                        Some(idle_since),
                        Some(remaining),
                    )
                }
            }
            Some(desired) => (ScaleStatus::Active, desired.max(1), None, None),
            None => (ScaleStatus::Active, previous_scale.max(1), None, None),
        },
    };

    Plan {
        scale_status,
        routing_mode: routing_mode_for(scale_status),
        desired_scale,
        idle_since,
        requeue_after,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn status(scale_status: ScaleStatus, desired_scale: i32) -> PodAutoscalerStatus {
        PodAutoscalerStatus {
            scale_status: Some(scale_status),
            desired_scale: Some(desired_scale),
            ..Default::default()
        }
    }

    fn decision(desired_scale: i32) -> Decision {
        Decision {
            desired_scale,
            ..Default::default()
        }
    }

    fn observe<'a>(
        status: Option<&'a PodAutoscalerStatus>,
        decision: Option<&'a Decision>,
        ready_replicas: i32,
    ) -> Observation<'a> {
        Observation {
            status,
            decision,
            reachability: Reachability::Reachable,
            ready_replicas,
        }
    }

    #[test]
    fn test_missing_status_starts_activating() {
        let plan = plan(&observe(None, None, 0), &AutoscalerConfig::default(), at(0));
        assert_eq!(plan.scale_status, ScaleStatus::Activating);
        assert_eq!(plan.routing_mode, RoutingMode::Proxy);
        assert_eq!(plan.desired_scale, 1);
    }

    #[test]
    fn test_inactive_activates_on_demand() {
        let config = AutoscalerConfig::default();
        let inactive = status(ScaleStatus::Inactive, 0);

        let idle = plan(&observe(Some(&inactive), Some(&decision(0)), 0), &config, at(0));
        assert_eq!(idle.scale_status, ScaleStatus::Inactive);
        assert_eq!(idle.desired_scale, 0);
        assert_eq!(idle.routing_mode, RoutingMode::Proxy);

        let woken = plan(&observe(Some(&inactive), Some(&decision(3)), 0), &config, at(0));
        assert_eq!(woken.scale_status, ScaleStatus::Activating);
        assert_eq!(woken.desired_scale, 3);
        assert_eq!(woken.routing_mode, RoutingMode::Proxy);
    }

    #[test]
    fn test_pending_requests_activate_unless_unreachable() {
        let config = AutoscalerConfig::default();
        let inactive = status(ScaleStatus::Inactive, 0);
        let pending = Decision {
            desired_scale: 0,
            pending_requests: 2,
            ..Default::default()
        };

        let mut observed = observe(Some(&inactive), Some(&pending), 0);
        let woken = plan(&observed, &config, at(0));
        assert_eq!(woken.scale_status, ScaleStatus::Activating);
        assert_eq!(woken.desired_scale, 1);

        observed.reachability = Reachability::Unreachable;
        let idle = plan(&observed, &config, at(0));
        assert_eq!(idle.scale_status, ScaleStatus::Inactive);
        assert_eq!(idle.desired_scale, 0);
    }

    #[test]
    fn test_activating_waits_for_ready_replicas() {
        let config = AutoscalerConfig {
            activation_min_ready_replicas: 2,
            ..Default::default()
        };
        let activating = status(ScaleStatus::Activating, 3);

        let waiting = plan(&observe(Some(&activating), Some(&decision(3)), 1), &config, at(0));
        assert_eq!(waiting.scale_status, ScaleStatus::Activating);
        assert_eq!(waiting.routing_mode, RoutingMode::Proxy);
        assert_eq!(waiting.desired_scale, 3);

        let ready = plan(&observe(Some(&activating), Some(&decision(3)), 2), &config, at(0));
        assert_eq!(ready.scale_status, ScaleStatus::Active);
        assert_eq!(ready.routing_mode, RoutingMode::Serve);
        assert_eq!(ready.desired_scale, 3);
    }

    #[test]
    fn test_one_transition_per_pass() {
        // Ready replicas alone do not take an inactive revision straight to active.
        let inactive = status(ScaleStatus::Inactive, 0);
        let plan = plan(
            &observe(Some(&inactive), Some(&decision(2)), 5),
            &AutoscalerConfig::default(),
            at(0),
        );
        assert_eq!(plan.scale_status, ScaleStatus::Activating);
    }

    #[test]
    fn test_active_follows_decision() {
        let config = AutoscalerConfig::default();
        let active = status(ScaleStatus::Active, 3);

        let up = plan(&observe(Some(&active), Some(&decision(5)), 3), &config, at(0));
        assert_eq!(up.scale_status, ScaleStatus::Active);
        assert_eq!(up.desired_scale, 5);
        assert_eq!(up.requeue_after, None);

        let unknown = plan(&observe(Some(&active), None, 3), &config, at(0));
        assert_eq!(unknown.desired_scale, 3);
    }

    #[test]
    fn test_scale_to_zero_waits_for_grace_period() {
        let config = AutoscalerConfig::default();
        let mut active = status(ScaleStatus::Active, 3);
        let zero = decision(0);

        let first = plan(&observe(Some(&active), Some(&zero), 3), &config, at(0));
        assert_eq!(first.scale_status, ScaleStatus::Active);
        assert_eq!(first.routing_mode, RoutingMode::Serve);
        assert_eq!(first.desired_scale, 3);
        assert_eq!(first.idle_since, Some(at(0)));
        assert_eq!(first.requeue_after, Some(Duration::from_secs(30)));

        active.idle_since = first.idle_since.map(Time);
        let later = plan(&observe(Some(&active), Some(&zero), 3), &config, at(20));
        assert_eq!(later.scale_status, ScaleStatus::Active);
        assert_eq!(later.idle_since, Some(at(0)));
        assert_eq!(later.requeue_after, Some(Duration::from_secs(10)));

        let expired = plan(&observe(Some(&active), Some(&zero), 3), &config, at(30));
        assert_eq!(expired.scale_status, ScaleStatus::Inactive);
        assert_eq!(expired.routing_mode, RoutingMode::Proxy);
        assert_eq!(expired.desired_scale, 0);
        assert_eq!(expired.idle_since, None);
        assert_eq!(expired.requeue_after, None);
    }

    #[test]
    fn test_rebound_clears_idle_period() {
        let config = AutoscalerConfig::default();
        let mut active = status(ScaleStatus::Active, 3);
        active.idle_since = Some(Time(at(0)));

        let rebound = plan(&observe(Some(&active), Some(&decision(2)), 3), &config, at(15));
        assert_eq!(rebound.scale_status, ScaleStatus::Active);
        assert_eq!(rebound.desired_scale, 2);
        assert_eq!(rebound.idle_since, None);

        // A new zero decision starts a fresh grace period
        active.desired_scale = Some(2);
        active.idle_since = None;
        let zero = plan(&observe(Some(&active), Some(&decision(0)), 2), &config, at(31));
        assert_eq!(zero.scale_status, ScaleStatus::Active);
        assert_eq!(zero.idle_since, Some(at(31)));
    }

    #[test]
    fn test_scale_to_zero_disabled() {
        let config = AutoscalerConfig {
            enable_scale_to_zero: false,
            ..Default::default()
        };
        let active = status(ScaleStatus::Active, 3);
        let plan = plan(&observe(Some(&active), Some(&decision(0)), 3), &config, at(3600));
        assert_eq!(plan.scale_status, ScaleStatus::Active);
        assert_eq!(plan.desired_scale, 1);
        assert_eq!(plan.requeue_after, None);
    }
}
