//! Funnel definitions and per-session funnel analysis.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CoreError;
use crate::matcher::{StepMatcher, TrackedEvent};

#[derive(Debug, Clone)]
pub struct FunnelStep {
    pub id: String,
    pub name: String,
    pub matcher: StepMatcher,
}

impl FunnelStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>, matcher: StepMatcher) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            matcher,
        }
    }
}

/// An ordered list of at least two steps, optionally bounded by a window
/// measured from the first matched step.
#[derive(Debug, Clone)]
pub struct Funnel {
    id: String,
    name: String,
    steps: Vec<FunnelStep>,
    window_ms: Option<i64>,
}

impl Funnel {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        steps: Vec<FunnelStep>,
        window_ms: Option<i64>,
    ) -> Result<Self, CoreError> {
        if steps.len() < 2 {
            return Err(CoreError::InvalidFunnel(format!(
                "a funnel needs at least 2 steps, got {}",
                steps.len()
            )));
        }
        if let Some(window) = window_ms {
            if window <= 0 {
                return Err(CoreError::InvalidFunnel(
                    "window must be positive".to_string(),
                ));
            }
        }
        Ok(Self {
            id: id.into(),
            name: name.into(),
            steps,
            window_ms,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[FunnelStep] {
        &self.steps
    }

    pub fn window_ms(&self) -> Option<i64> {
        self.window_ms
    }
}

/// Progress of one `(visitor, session)` through a funnel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJourney {
    pub visitor_id: String,
    pub session_id: String,
    pub steps_completed: usize,
    pub total_steps: usize,
    pub completed: bool,
    pub step_timestamps: Vec<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time_ms: Option<i64>,
    /// Id of the first step this journey did not reach.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drop_off_step: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelStepStats {
    pub step_id: String,
    pub name: String,
    pub reached: usize,
    pub drop_off: usize,
    pub conversion_from_previous: f64,
    pub conversion_from_start: f64,
    /// Mean time from this step to the next, over sessions that reached it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_time_to_next_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelAnalysis {
    pub funnel_id: String,
    pub name: String,
    pub total_entries: usize,
    pub completions: usize,
    pub conversion_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_completion_time_ms: Option<f64>,
    pub steps: Vec<FunnelStepStats>,
    pub journeys: Vec<UserJourney>,
}

pub struct FunnelAnalyzer;

impl FunnelAnalyzer {
    /// Group `events` by session, walk each session in time order and
    /// aggregate the per-step results. Sessions that never match the first
    /// step are left out entirely.
    pub fn analyze(funnel: &Funnel, events: &[TrackedEvent]) -> FunnelAnalysis {
        let mut order: Vec<(&str, &str)> = Vec::new();
        let mut sessions: HashMap<(&str, &str), Vec<&TrackedEvent>> = HashMap::new();
        for event in events {
            let key = (event.visitor_id(), event.session_id());
            sessions
                .entry(key)
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(event);
        }

        let mut journeys = Vec::new();
        for key in order {
            let Some(mut group) = sessions.remove(&key) else {
                continue;
            };
            group.sort_by_key(|event| event.timestamp());
            let journey = Self::journey(funnel, key.0, key.1, &group);
            if journey.steps_completed > 0 {
                journeys.push(journey);
            }
        }

        Self::aggregate(funnel, journeys)
    }

    /// Walk one session's events, already sorted by time.
    pub fn journey(
        funnel: &Funnel,
        visitor_id: &str,
        session_id: &str,
        events: &[&TrackedEvent],
    ) -> UserJourney {
        let steps = funnel.steps();
        let mut current = 0;
        let mut step_timestamps: Vec<DateTime<Utc>> = Vec::with_capacity(steps.len());

        for event in events {
            if current == steps.len() {
                break;
            }
            if let (Some(window), Some(first)) = (funnel.window_ms(), step_timestamps.first()) {
                if (event.timestamp() - *first).num_milliseconds() > window {
                    break;
                }
            }
            if steps[current].matcher.matches(event) {
                step_timestamps.push(event.timestamp());
                current += 1;
            }
        }

        let completed = current == steps.len();
        let completion_time_ms = match (completed, step_timestamps.first(), step_timestamps.last())
        {
            (true, Some(first), Some(last)) => Some((*last - *first).num_milliseconds()),
            _ => None,
        };
        let drop_off_step = if completed || current == 0 {
            None
        } else {
            Some(steps[current].id.clone())
        };

        UserJourney {
            visitor_id: visitor_id.to_string(),
            session_id: session_id.to_string(),
            steps_completed: current,
            total_steps: steps.len(),
            completed,
            step_timestamps,
            completion_time_ms,
            drop_off_step,
        }
    }

    fn aggregate(funnel: &Funnel, journeys: Vec<UserJourney>) -> FunnelAnalysis {
        let total_entries = journeys.len();
        let steps = funnel.steps();

        let reached: Vec<usize> = (0..steps.len())
            .map(|idx| journeys.iter().filter(|j| j.steps_completed > idx).count())
            .collect();

        let mut step_stats = Vec::with_capacity(steps.len());
        for (idx, step) in steps.iter().enumerate() {
            let previous = if idx == 0 {
                total_entries
            } else {
                reached[idx - 1]
            };
            let next_reached = reached.get(idx + 1).copied().unwrap_or(reached[idx]);
            let deltas: Vec<i64> = journeys
                .iter()
                .filter(|j| j.steps_completed > idx + 1)
                .map(|j| (j.step_timestamps[idx + 1] - j.step_timestamps[idx]).num_milliseconds())
                .collect();

            step_stats.push(FunnelStepStats {
                step_id: step.id.clone(),
                name: step.name.clone(),
                reached: reached[idx],
                drop_off: reached[idx].saturating_sub(next_reached),
                conversion_from_previous: ratio(reached[idx], previous),
                conversion_from_start: ratio(reached[idx], total_entries),
                avg_time_to_next_ms: mean(&deltas),
            });
        }

        let completion_times: Vec<i64> = journeys
            .iter()
            .filter_map(|j| j.completion_time_ms)
            .collect();
        let completions = journeys.iter().filter(|j| j.completed).count();

        FunnelAnalysis {
            funnel_id: funnel.id().to_string(),
            name: funnel.name().to_string(),
            total_entries,
            completions,
            conversion_rate: ratio(completions, total_entries),
            avg_completion_time_ms: mean(&completion_times),
            steps: step_stats,
            journeys,
        }
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn mean(values: &[i64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<i64>() as f64 / values.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CustomEvent, PageView};
    use chrono::TimeZone;

    fn at_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_767_225_600_000 + ms).unwrap()
    }

    fn page(session: &str, path: &str, ms: i64) -> TrackedEvent {
        TrackedEvent::PageView(PageView::new("site_1", session, "vis_1", path, at_ms(ms)))
    }

    fn abc_funnel(window_ms: Option<i64>) -> Funnel {
        Funnel::new(
            "fun_1",
            "Checkout",
            vec![
                FunnelStep::new("a", "Landing", StepMatcher::path("/a")),
                FunnelStep::new("b", "Cart", StepMatcher::path("/b")),
                FunnelStep::new("c", "Paid", StepMatcher::path("/c")),
            ],
            window_ms,
        )
        .unwrap()
    }

    #[test]
    fn rejects_funnels_with_fewer_than_two_steps() {
        let err = Funnel::new(
            "fun_1",
            "Too short",
            vec![FunnelStep::new("a", "A", StepMatcher::path("/a"))],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidFunnel(_)));
    }

    #[test]
    fn in_order_session_completes() {
        let events = vec![page("s1", "/a", 0), page("s1", "/b", 10), page("s1", "/c", 25)];
        let analysis = FunnelAnalyzer::analyze(&abc_funnel(None), &events);

        assert_eq!(analysis.total_entries, 1);
        assert_eq!(analysis.completions, 1);
        let journey = &analysis.journeys[0];
        assert_eq!(journey.steps_completed, 3);
        assert!(journey.completed);
        assert_eq!(journey.completion_time_ms, Some(25));
        assert_eq!(journey.drop_off_step, None);
    }

    #[test]
    fn skipped_step_drops_off_at_that_step() {
        let events = vec![page("s1", "/a", 0), page("s1", "/c", 10)];
        let analysis = FunnelAnalyzer::analyze(&abc_funnel(None), &events);

        let journey = &analysis.journeys[0];
        assert_eq!(journey.steps_completed, 1);
        assert!(!journey.completed);
        assert_eq!(journey.drop_off_step.as_deref(), Some("b"));
    }

    #[test]
    fn events_are_sorted_before_walking() {
        let events = vec![page("s1", "/c", 30), page("s1", "/b", 20), page("s1", "/a", 10)];
        let analysis = FunnelAnalyzer::analyze(&abc_funnel(None), &events);
        assert_eq!(analysis.journeys[0].steps_completed, 3);
    }

    #[test]
    fn window_freezes_the_journey() {
        let funnel = Funnel::new(
            "fun_2",
            "Signup",
            vec![
                FunnelStep::new("a", "A", StepMatcher::path("/a")),
                FunnelStep::new("b", "B", StepMatcher::path("/b")),
            ],
            Some(1000),
        )
        .unwrap();
        let events = vec![page("s1", "/a", 0), page("s1", "/b", 1500)];
        let analysis = FunnelAnalyzer::analyze(&funnel, &events);

        let journey = &analysis.journeys[0];
        assert_eq!(journey.steps_completed, 1);
        assert!(!journey.completed);
        assert_eq!(analysis.completions, 0);
    }

    #[test]
    fn sessions_without_a_first_step_are_not_entries() {
        let events = vec![
            page("s1", "/a", 0),
            page("s1", "/b", 100),
            page("s2", "/b", 0),
            page("s2", "/c", 50),
        ];
        let analysis = FunnelAnalyzer::analyze(&abc_funnel(None), &events);
        assert_eq!(analysis.total_entries, 1);
        assert_eq!(analysis.journeys.len(), 1);
        assert_eq!(analysis.journeys[0].session_id, "s1");
    }

    #[test]
    fn step_rates_and_time_to_next() {
        let events = vec![
            page("s1", "/a", 0),
            page("s1", "/b", 100),
            page("s1", "/c", 400),
            page("s2", "/a", 0),
            page("s2", "/b", 300),
            page("s3", "/a", 0),
            page("s4", "/a", 0),
        ];
        let analysis = FunnelAnalyzer::analyze(&abc_funnel(None), &events);

        assert_eq!(analysis.total_entries, 4);
        let [a, b, c] = [&analysis.steps[0], &analysis.steps[1], &analysis.steps[2]];
        assert_eq!((a.reached, b.reached, c.reached), (4, 2, 1));
        assert!((a.conversion_from_previous - 1.0).abs() < 1e-9);
        assert!((b.conversion_from_previous - 0.5).abs() < 1e-9);
        assert!((c.conversion_from_previous - 0.5).abs() < 1e-9);
        assert!((c.conversion_from_start - 0.25).abs() < 1e-9);
        assert_eq!(a.drop_off, 2);
        assert_eq!(b.drop_off, 1);
        assert_eq!(c.drop_off, 0);
        assert_eq!(a.avg_time_to_next_ms, Some(200.0));
        assert_eq!(b.avg_time_to_next_ms, Some(300.0));
        assert_eq!(c.avg_time_to_next_ms, None);
        assert!((analysis.conversion_rate - 0.25).abs() < 1e-9);
    }

    #[test]
    fn zero_entries_yield_zero_rates() {
        let analysis = FunnelAnalyzer::analyze(&abc_funnel(None), &[]);
        assert_eq!(analysis.total_entries, 0);
        assert_eq!(analysis.conversion_rate, 0.0);
        assert!(analysis
            .steps
            .iter()
            .all(|s| s.conversion_from_start == 0.0 && s.conversion_from_previous == 0.0));
    }

    #[test]
    fn mixes_page_views_and_custom_events() {
        let funnel = Funnel::new(
            "fun_3",
            "Trial",
            vec![
                FunnelStep::new("pricing", "Pricing", StepMatcher::path("/pricing")),
                FunnelStep::new("start", "Start trial", StepMatcher::event("trial_started")),
            ],
            None,
        )
        .unwrap();
        let events = vec![
            page("s1", "/pricing", 0),
            TrackedEvent::Custom(CustomEvent::new(
                "site_1",
                "s1",
                "vis_1",
                "trial_started",
                at_ms(2_000),
            )),
        ];
        let analysis = FunnelAnalyzer::analyze(&funnel, &events);
        assert_eq!(analysis.completions, 1);
        assert_eq!(analysis.journeys[0].completion_time_ms, Some(2_000));
    }
}
