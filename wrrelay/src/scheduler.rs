//! Timezone-aware cron scheduler
//!
//! Each rule is compiled once at startup against a named IANA timezone and
//! evaluated in that zone, so "00:10 every day" fires at 00:10 station time
//! whatever the host timezone is. Every rule runs its own timer loop; a
//! firing is spawned as an independent task so one failing rule never holds
//! up another.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::models::{RuleAction, ScheduleRule};
use crate::player::{MessagePlayer, PlaybackOutcome};
use crate::registry::SourceRegistry;
use crate::station::{Station, SwitchResult};

/// Firings later than this (host suspended, clock jump) are skipped
const MISSED_FIRING_TOLERANCE: TimeDelta = TimeDelta::seconds(60);
/// How far back the startup programme resolution looks
const PROGRAMME_LOOKBACK: TimeDelta = TimeDelta::days(8);

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Parses an IANA timezone name
pub fn parse_timezone(name: &str) -> Result<Tz> {
    Tz::from_str(name).map_err(|_| Error::Timezone(name.to_string()))
}

/// Rewrites a five-field expression (minute first, day-of-week 0-7 with
/// 0 and 7 = Sunday) into the seconds-first form understood by `cron`.
/// Six and seven field expressions are returned unchanged.
pub fn normalize_expression(expr: &str) -> std::result::Result<String, String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = day_names(fields[4])?;
            Ok(format!("0 {} {}", fields[..4].join(" "), dow))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(format!("expected 5, 6 or 7 fields, found {n}")),
    }
}

/// Replaces numeric days of week by their names; step values are kept.
/// `cron` counts Sunday as the first day, so a range ending on 7 is
/// spelled out as a list.
fn day_names(field: &str) -> std::result::Result<String, String> {
    let items = field
        .split(',')
        .map(day_item)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items.join(","))
}

fn day_item(item: &str) -> std::result::Result<String, String> {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (item, None),
    };

    let named = match base.split_once('-') {
        Some((from, to)) => match (day_number(from)?, day_number(to)?) {
            (Some(first), Some(7)) => return sunday_range(first, step),
            (first, last) => format!(
                "{}-{}",
                first.map_or(from, |d| DAY_NAMES[d % 7]),
                last.map_or(to, |d| DAY_NAMES[d % 7])
            ),
        },
        None => match day_number(base)? {
            Some(day) => DAY_NAMES[day % 7].to_string(),
            None => base.to_string(),
        },
    };

    Ok(match step {
        Some(step) => format!("{named}/{step}"),
        None => named,
    })
}

fn sunday_range(first: usize, step: Option<&str>) -> std::result::Result<String, String> {
    let step = match step {
        Some(s) => s.parse::<usize>().map_err(|_| format!("bad step {s}"))?,
        None => 1,
    };
    if step == 0 {
        return Err("step of 0 in day of week".to_string());
    }

    let mut days: Vec<&str> = Vec::new();
    for day in (first..=7).step_by(step) {
        let name = DAY_NAMES[day % 7];
        if !days.contains(&name) {
            days.push(name);
        }
    }
    Ok(days.join(","))
}

/// Numeric day of week, `None` for names and wildcards
fn day_number(text: &str) -> std::result::Result<Option<usize>, String> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }
    let day: usize = text
        .parse()
        .map_err(|_| format!("bad day of week {text}"))?;
    if day > 7 {
        return Err(format!("day of week {day} out of range"));
    }
    Ok(Some(day))
}

/// A rule ready to be evaluated
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub rule: ScheduleRule,
    pub timezone: Tz,
    schedule: Schedule,
}

impl CompiledRule {
    /// Validates the expression, the timezone and the source key of a
    /// switch rule
    pub fn compile(rule: &ScheduleRule, default_tz: Tz, registry: &SourceRegistry) -> Result<Self> {
        let name = if rule.name.is_empty() {
            format!("{} {}", rule.cron, action_label(&rule.action))
        } else {
            rule.name.clone()
        };

        let timezone = match rule.timezone.as_deref() {
            Some(tz) => parse_timezone(tz)?,
            None => default_tz,
        };

        let expression =
            normalize_expression(&rule.cron).map_err(|reason| Error::schedule(&name, reason))?;
        let schedule =
            Schedule::from_str(&expression).map_err(|e| Error::schedule(&name, e.to_string()))?;

        if let RuleAction::SwitchSource { source } = &rule.action {
            if !registry.contains(source) {
                return Err(Error::UnknownSource(source.clone()));
            }
        }

        Ok(Self {
            name,
            rule: rule.clone(),
            timezone,
            schedule,
        })
    }

    pub fn action(&self) -> &RuleAction {
        &self.rule.action
    }

    /// First firing strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Latest firing in `(now - window, now]`
    pub fn last_at_or_before(&self, now: DateTime<Utc>, window: TimeDelta) -> Option<DateTime<Utc>> {
        let start = (now - window).with_timezone(&self.timezone);
        self.schedule
            .after(&start)
            .map(|t| t.with_timezone(&Utc))
            .take_while(|t| *t <= now)
            .last()
    }
}

fn action_label(action: &RuleAction) -> String {
    match action {
        RuleAction::SwitchSource { source } => format!("switch to {source}"),
        RuleAction::PlayRandomMessage => "random message".into(),
        RuleAction::PlayMessageSequence { .. } => "message sequence".into(),
        RuleAction::EndOverride => "end of block".into(),
    }
}

/// Wall clock used by the scheduler
///
/// `Virtual` follows tokio's clock from a fixed origin, so tests driven by a
/// paused runtime see the wall clock advance with their timers.
#[derive(Debug, Clone, Copy)]
pub enum Clock {
    System,
    Virtual {
        origin: DateTime<Utc>,
        started: tokio::time::Instant,
    },
}

impl Clock {
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self::Virtual {
            origin,
            started: tokio::time::Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Self::System => Utc::now(),
            Self::Virtual { origin, started } => {
                let elapsed = TimeDelta::from_std(started.elapsed()).unwrap_or(TimeDelta::MAX);
                *origin + elapsed
            }
        }
    }
}

/// A future firing, as listed by the API
#[derive(Debug, Clone, Serialize)]
pub struct UpcomingFiring {
    pub rule: String,
    pub at: DateTime<Utc>,
    /// Same instant in the rule's timezone
    pub local_time: String,
    pub action: RuleAction,
}

pub struct Scheduler {
    rules: Vec<Arc<CompiledRule>>,
    station: Arc<Station>,
    player: Arc<MessagePlayer>,
    clock: Clock,
    token: CancellationToken,
}

impl Scheduler {
    /// Compiles every rule; the first invalid one is an error
    pub fn new(
        rules: &[ScheduleRule],
        timezone: &str,
        station: Arc<Station>,
        player: Arc<MessagePlayer>,
        token: CancellationToken,
    ) -> Result<Self> {
        let default_tz = parse_timezone(timezone)?;
        let rules = rules
            .iter()
            .map(|r| CompiledRule::compile(r, default_tz, station.registry()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        info!(rules = rules.len(), timezone, "Schedule compiled");
        Ok(Self {
            rules,
            station,
            player,
            clock: Clock::System,
            token,
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn rules(&self) -> &[Arc<CompiledRule>] {
        &self.rules
    }

    /// Starts one timer loop per rule
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.rules
            .iter()
            .map(|rule| {
                let scheduler = Arc::clone(self);
                let rule = Arc::clone(rule);
                tokio::spawn(async move { scheduler.run_rule(rule).await })
            })
            .collect()
    }

    async fn run_rule(self: Arc<Self>, rule: Arc<CompiledRule>) {
        let mut last_fired: Option<DateTime<Utc>> = None;

        loop {
            let now = self.clock.now();
            let from = last_fired.map_or(now, |last| last.max(now));
            let Some(next) = rule.next_after(from) else {
                warn!(rule = %rule.name, "Rule will never fire again");
                break;
            };

            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            last_fired = Some(next);

            let late = self.clock.now() - next;
            if late > MISSED_FIRING_TOLERANCE {
                warn!(rule = %rule.name, late_secs = late.num_seconds(), "Missed firing skipped");
                continue;
            }

            debug!(rule = %rule.name, at = %next, "Rule fired");
            let scheduler = Arc::clone(&self);
            let rule = Arc::clone(&rule);
            tokio::spawn(async move {
                if let Err(e) = scheduler.run_action(rule.action()).await {
                    error!(rule = %rule.name, "Rule failed: {}", e);
                }
            });
        }
        debug!(rule = %rule.name, "Rule loop stopped");
    }

    /// Executes one action
    pub async fn run_action(&self, action: &RuleAction) -> Result<()> {
        match action {
            RuleAction::SwitchSource { source } => match self.station.switch_source(source)? {
                SwitchResult::Switched { epoch } => {
                    info!(source = %source, epoch, "Scheduled switch applied")
                }
                SwitchResult::AlreadyActive => debug!(source = %source, "Already on air"),
                SwitchResult::Deferred => {
                    info!(source = %source, "Scheduled switch waits for the message to end")
                }
            },
            RuleAction::PlayRandomMessage => {
                log_playback(self.player.play_random(self.deadline_instant()).await)
            }
            RuleAction::PlayMessageSequence { limit, shuffle } => log_playback(
                self.player
                    .play_sequence(*limit, *shuffle, self.deadline_instant())
                    .await,
            ),
            RuleAction::EndOverride => {
                if !self.player.force_end() {
                    debug!("End of block: no message on air");
                }
            }
        }
        Ok(())
    }

    /// Next end-of-block firing after `now`
    pub fn next_deadline(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.rules
            .iter()
            .filter(|rule| *rule.action() == RuleAction::EndOverride)
            .filter_map(|rule| rule.next_after(now))
            .min()
    }

    /// [`Scheduler::next_deadline`] on tokio's clock, handed to message
    /// blocks so they never announce a message past the end of their slot
    pub fn deadline_instant(&self) -> Option<Instant> {
        let now = self.clock.now();
        let at = self.next_deadline(now)?;
        Some(Instant::now() + (at - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Source the programme says should be on air at `now`: the target of
    /// the latest switch rule that fired in the past week
    pub fn resolve_current_programme(&self, now: DateTime<Utc>) -> Option<String> {
        self.rules
            .iter()
            .filter_map(|rule| match rule.action() {
                RuleAction::SwitchSource { source } => rule
                    .last_at_or_before(now, PROGRAMME_LOOKBACK)
                    .map(|at| (at, source.clone())),
                _ => None,
            })
            .max_by_key(|(at, _)| *at)
            .map(|(_, source)| source)
    }

    /// The next `count` firings across all rules
    pub fn upcoming(&self, now: DateTime<Utc>, count: usize) -> Vec<UpcomingFiring> {
        let mut firings: Vec<UpcomingFiring> = self
            .rules
            .iter()
            .flat_map(|rule| {
                rule.schedule
                    .after(&now.with_timezone(&rule.timezone))
                    .take(count)
                    .map(|local| UpcomingFiring {
                        rule: rule.name.clone(),
                        at: local.with_timezone(&Utc),
                        local_time: local.format("%Y-%m-%d %H:%M:%S %Z").to_string(),
                        action: rule.action().clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        firings.sort_by_key(|f| f.at);
        firings.truncate(count);
        firings
    }
}

fn log_playback(outcome: PlaybackOutcome) {
    match outcome {
        PlaybackOutcome::Completed { played } => debug!(played, "Scheduled messages played"),
        PlaybackOutcome::Interrupted { played } => info!(played, "Scheduled block interrupted"),
        PlaybackOutcome::Skipped { reason } => info!("Scheduled message skipped: {}", reason),
    }
}
