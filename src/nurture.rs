//! Lead nurturing scheduler.
//!
//! Each pass rescores every lead and applies at most one rule, checked in
//! this order:
//!
//! | # | Rule | Applies to | Transition | Event |
//! |---|------|------------|------------|-------|
//! | 1 | qualification signal present | any unsettled state | → qualified | `qualified` |
//! | 2 | no contact within the inactivity window | hot, warm | → cold | `inactivity` |
//! | 3 | score below the hot threshold | hot | → warm | `cooling` |
//! | 4 | score at or above the threshold, contacted within the recency window | new | → hot | `hot_lead` |
//! | 5 | `next_follow_up_at` has passed | any unsettled state | none | `follow_up_due` |
//!
//! Qualified and closed leads are never moved by the scheduler; closing is an
//! agent action ([`apply_action`]). After a transition or follow-up the next
//! follow-up is rescheduled by the state's cadence.
//!
//! Passes never overlap: a pass that starts while another is running returns
//! [`PassOutcome::Skipped`]. An event is only emitted when no undelivered
//! event for the same lead and reason is pending, so repeated passes over
//! unchanged data emit nothing new.
//!
//! Lead writes are compare-and-set on [`Lead::version`]. When an agent
//! action lands between the pass reading a lead and saving it, the pass
//! re-reads the lead and evaluates the fresh copy instead.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use estate_harness_core::models::{Lead, NotificationEvent, NurtureState, TriggerReason};
use estate_harness_core::store::LeadStore;

use crate::config::NurtureRules;

const RECENCY_POINTS: f64 = 50.0;
const POINTS_PER_CONTACT: f64 = 3.0;
const POINTS_PER_ENGAGEMENT: f64 = 2.0;
const MAX_COUNTED_SIGNALS: u32 = 10;
const MAX_SAVE_ATTEMPTS: usize = 3;

/// Delivery collaborator for notification events. Fire-and-forget: the
/// scheduler logs enqueue failures and moves on.
#[async_trait]
pub trait NotificationDispatch: Send + Sync {
    async fn enqueue(&self, event: &NotificationEvent) -> Result<()>;
}

/// Dispatch that only logs; events stay pending in the ledger until a
/// collaborator marks them delivered.
pub struct LogDispatch;

#[async_trait]
impl NotificationDispatch for LogDispatch {
    async fn enqueue(&self, event: &NotificationEvent) -> Result<()> {
        info!(
            event_id = %event.event_id,
            lead_id = %event.lead_id,
            reason = %event.trigger_reason,
            due_at = %event.due_at,
            "notification enqueued"
        );
        Ok(())
    }
}

/// Score in `[0, 100]` from recency, contact frequency and engagement.
///
/// Recency contributes up to 50 points, decaying linearly to zero over the
/// inactivity window. Contacts and engagement events inside the activity
/// window add 3 and 2 points each, counting at most ten of each.
pub fn score_lead(lead: &Lead, now: DateTime<Utc>, rules: &NurtureRules) -> f64 {
    let recency = match lead.last_contacted_at {
        Some(at) => {
            let window = rules.inactivity_window.num_seconds().max(1) as f64;
            let elapsed = (now - at).num_seconds().max(0) as f64;
            RECENCY_POINTS * (1.0 - elapsed / window).max(0.0)
        }
        None => 0.0,
    };
    let contacts = lead.contacts_within(now, rules.activity_window);
    let engagements = lead.engagements_within(now, rules.activity_window);
    let frequency = contacts.min(MAX_COUNTED_SIGNALS) as f64 * POINTS_PER_CONTACT;
    let engagement = engagements.min(MAX_COUNTED_SIGNALS) as f64 * POINTS_PER_ENGAGEMENT;
    (recency + frequency + engagement).clamp(0.0, 100.0)
}

fn cadence(state: NurtureState, rules: &NurtureRules) -> Option<chrono::Duration> {
    match state {
        NurtureState::New => Some(rules.follow_up_new),
        NurtureState::Hot => Some(rules.follow_up_hot),
        NurtureState::Warm => Some(rules.follow_up_warm),
        NurtureState::Cold => Some(rules.follow_up_cold),
        NurtureState::Qualified | NurtureState::Closed => None,
    }
}

/// Outcome of evaluating one lead.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub lead: Lead,
    pub transition: Option<(NurtureState, NurtureState)>,
    pub trigger: Option<TriggerReason>,
}

/// Apply the rule table to one lead. Pure; the caller persists and emits.
pub fn evaluate(lead: &Lead, now: DateTime<Utc>, rules: &NurtureRules) -> Evaluation {
    let mut next = lead.clone();
    next.trim_activity(now, rules.activity_window);
    next.score = score_lead(lead, now, rules);
    let from = lead.nurture_state;

    if from.is_settled() {
        next.next_follow_up_at = None;
        return Evaluation {
            lead: next,
            transition: None,
            trigger: None,
        };
    }

    let last_touch = lead.last_contacted_at.unwrap_or(lead.created_at);
    let transition = if lead.qualified_signal_at.is_some() {
        Some((NurtureState::Qualified, TriggerReason::Qualified))
    } else if matches!(from, NurtureState::Hot | NurtureState::Warm)
        && now - last_touch >= rules.inactivity_window
    {
        Some((NurtureState::Cold, TriggerReason::Inactivity))
    } else if from == NurtureState::Hot && next.score < rules.hot_score_threshold {
        Some((NurtureState::Warm, TriggerReason::Cooling))
    } else if from == NurtureState::New
        && next.score >= rules.hot_score_threshold
        && lead
            .last_contacted_at
            .is_some_and(|at| now - at <= rules.recency_window)
    {
        Some((NurtureState::Hot, TriggerReason::HotLead))
    } else {
        None
    };

    if let Some((to, reason)) = transition {
        next.nurture_state = to;
        if to == NurtureState::Qualified {
            next.qualified_signal_at = None;
        }
        next.next_follow_up_at = cadence(to, rules).map(|c| now + c);
        return Evaluation {
            lead: next,
            transition: Some((from, to)),
            trigger: Some(reason),
        };
    }

    match lead.next_follow_up_at {
        Some(due) if due <= now => {
            next.next_follow_up_at = cadence(from, rules).map(|c| now + c);
            Evaluation {
                lead: next,
                transition: None,
                trigger: Some(TriggerReason::FollowUpDue),
            }
        }
        Some(_) => Evaluation {
            lead: next,
            transition: None,
            trigger: None,
        },
        None => {
            next.next_follow_up_at = cadence(from, rules).map(|c| now + c);
            Evaluation {
                lead: next,
                transition: None,
                trigger: None,
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub leads_scanned: usize,
    pub transitions: usize,
    pub events_emitted: usize,
    /// Events not emitted because an undelivered one was already pending.
    pub duplicates_suppressed: usize,
    pub lead_errors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PassOutcome {
    Completed(PassReport),
    /// Another pass was in flight.
    Skipped,
}

pub struct NurtureScheduler {
    store: Arc<dyn LeadStore>,
    dispatch: Arc<dyn NotificationDispatch>,
    rules: NurtureRules,
    in_flight: Mutex<()>,
}

impl NurtureScheduler {
    pub fn new(store: Arc<dyn LeadStore>, dispatch: Arc<dyn NotificationDispatch>, rules: NurtureRules) -> Self {
        Self {
            store,
            dispatch,
            rules,
            in_flight: Mutex::new(()),
        }
    }

    pub async fn run_pass(&self) -> Result<PassOutcome> {
        self.run_pass_at(Utc::now()).await
    }

    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> Result<PassOutcome> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            info!("nurture pass skipped: previous pass still running");
            return Ok(PassOutcome::Skipped);
        };

        let leads = self.store.leads().await?;
        let mut report = PassReport {
            leads_scanned: leads.len(),
            ..PassReport::default()
        };
        for lead in leads {
            if let Err(e) = self.process(&lead, now, &mut report).await {
                report.lead_errors += 1;
                warn!(lead_id = %lead.lead_id, error = %e, "nurture evaluation failed");
            }
        }

        info!(
            leads = report.leads_scanned,
            transitions = report.transitions,
            events = report.events_emitted,
            suppressed = report.duplicates_suppressed,
            "nurture pass complete"
        );
        Ok(PassOutcome::Completed(report))
    }

    async fn process(&self, lead: &Lead, now: DateTime<Utc>, report: &mut PassReport) -> Result<()> {
        let mut current = lead.clone();
        let mut attempt = 0;
        let eval = loop {
            let eval = evaluate(&current, now, &self.rules);
            if eval.lead == current || self.store.save_lead(&eval.lead).await? {
                break eval;
            }
            attempt += 1;
            if attempt >= MAX_SAVE_ATTEMPTS {
                bail!("lead changed concurrently {} times", attempt);
            }
            debug!(lead_id = %lead.lead_id, attempt, "lead changed during pass, re-reading");
            match self.store.lead(&lead.lead_id).await? {
                Some(fresh) => current = fresh,
                None => return Ok(()),
            }
        };
        if let Some((from, to)) = eval.transition {
            report.transitions += 1;
            info!(lead_id = %lead.lead_id, from = from.as_str(), to = to.as_str(), score = eval.lead.score, "lead transitioned");
        }
        let Some(reason) = eval.trigger else {
            return Ok(());
        };

        if self.store.has_pending_event(&lead.lead_id, reason).await? {
            report.duplicates_suppressed += 1;
            debug!(lead_id = %lead.lead_id, reason = %reason, "event already pending");
            return Ok(());
        }
        let event = NotificationEvent::new(&lead.lead_id, reason, now);
        self.store.record_event(&event).await?;
        report.events_emitted += 1;
        if let Err(e) = self.dispatch.enqueue(&event).await {
            warn!(event_id = %event.event_id, error = %e, "notification enqueue failed");
        }
        Ok(())
    }

    /// Run a pass every `every` until the task is aborted. Missed ticks are
    /// skipped rather than bunched.
    pub fn spawn(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_pass().await {
                    warn!(error = %e, "nurture pass failed");
                }
            }
        })
    }
}

/// Agent-side updates to a lead, outside the scheduler's rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadAction {
    Contacted,
    Engaged,
    Qualified,
    Closed,
}

impl LeadAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "contacted" | "contact" => Some(Self::Contacted),
            "engaged" | "engagement" => Some(Self::Engaged),
            "qualified" | "qualify" => Some(Self::Qualified),
            "closed" | "close" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Record an agent action. Contact and engagement create the lead if absent.
///
/// The read-modify-write is retried when a concurrent save wins the race.
pub async fn apply_action(store: &dyn LeadStore, lead_id: &str, action: LeadAction, now: DateTime<Utc>) -> Result<Lead> {
    for _ in 0..MAX_SAVE_ATTEMPTS {
        let mut lead = match store.lead(lead_id).await? {
            Some(lead) => lead,
            None if matches!(action, LeadAction::Contacted | LeadAction::Engaged) => Lead::new(lead_id, now),
            None => bail!("unknown lead '{}'", lead_id),
        };
        match action {
            LeadAction::Contacted => lead.log_contact(now),
            LeadAction::Engaged => lead.log_engagement(now),
            LeadAction::Qualified => {
                if !lead.nurture_state.is_settled() {
                    lead.qualified_signal_at = Some(now);
                }
            }
            LeadAction::Closed => {
                lead.nurture_state = NurtureState::Closed;
                lead.qualified_signal_at = None;
                lead.next_follow_up_at = None;
            }
        }
        if store.save_lead(&lead).await? {
            lead.version += 1;
            return Ok(lead);
        }
        debug!(lead_id, "lead changed during agent action, retrying");
    }
    bail!("lead '{}' changed concurrently; action not applied", lead_id)
}
