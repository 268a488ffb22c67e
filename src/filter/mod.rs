//! Filtering, sorting and day grouping of the record set.
//!
//! Each pass works on an immutable snapshot and narrows the candidates in a
//! fixed order: directory, project, date, text, then sort and group. Passes
//! run on a worker thread; a newer filter state supersedes any pass still
//! running, and only the newest generation's output is published.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::watch;

use crate::calendar::CoverageMap;
use crate::error::Cancelled;
use crate::task::{GenerationalTask, Spawned, Ticket};
use crate::types::{DateDimension, DayZone, Project, SessionNote, SessionRecord, SortOrder};
use crate::utils::{contains_ignore_case, is_path_prefix};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DaySelection {
    #[default]
    None,
    Single(NaiveDate),
    Set(BTreeSet<NaiveDate>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterState {
    /// Working-directory prefix.
    pub directory: Option<String>,
    /// Project id; descendants are included.
    pub project: Option<String>,
    pub days: DaySelection,
    pub dimension: DateDimension,
    pub query: String,
    pub sort: SortOrder,
}

/// Ids matched by a completed full-text search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchHits {
    pub term: String,
    pub ids: HashSet<String>,
}

/// Everything one pass reads. Built by the caller, never mutated.
#[derive(Debug, Clone)]
pub struct FilterInput {
    pub records: Arc<Vec<SessionRecord>>,
    pub state: FilterState,
    pub projects: Arc<Vec<Project>>,
    pub notes: Arc<HashMap<String, SessionNote>>,
    pub coverage: Arc<CoverageMap>,
    pub search: Option<Arc<SearchHits>>,
    pub zone: DayZone,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DaySection {
    pub date: NaiveDate,
    pub records: Vec<SessionRecord>,
    pub total_duration: chrono::Duration,
    pub total_events: u64,
}

impl DaySection {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterOutput {
    pub generation: u64,
    pub state: FilterState,
    pub sections: Vec<DaySection>,
    pub total: usize,
}

impl FilterOutput {
    pub fn records(&self) -> impl Iterator<Item = &SessionRecord> {
        self.sections.iter().flat_map(|s| s.records.iter())
    }
}

/// The project with `id` and every project nested below it.
fn project_family<'a>(projects: &'a [Project], id: &str) -> Vec<&'a Project> {
    let mut family = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut frontier = vec![id];

    while let Some(current) = frontier.pop() {
        if !seen.insert(current) {
            continue;
        }
        if let Some(project) = projects.iter().find(|p| p.id == current) {
            family.push(project);
        }
        frontier.extend(
            projects
                .iter()
                .filter(|p| p.parent.as_deref() == Some(current))
                .map(|p| p.id.as_str()),
        );
    }
    family
}

fn in_project(record: &SessionRecord, family: &[&Project]) -> bool {
    let Some(cwd) = record.cwd.as_deref() else {
        return false;
    };
    family.iter().any(|project| {
        project.directories.iter().any(|dir| is_path_prefix(dir, cwd))
            && project.allowed_sources.as_ref().is_none_or(|allowed| {
                record
                    .source
                    .as_deref()
                    .is_some_and(|source| allowed.contains(source))
            })
    })
}

fn matches_day(
    record: &SessionRecord,
    day: NaiveDate,
    dimension: DateDimension,
    zone: DayZone,
    coverage: &CoverageMap,
) -> bool {
    record.date_for(dimension, zone) == day
        || (dimension == DateDimension::Updated && coverage.covers(&record.id, day))
}

fn matches_text(record: &SessionRecord, needle: &str, note: Option<&SessionNote>) -> bool {
    let in_title = record
        .title
        .as_deref()
        .is_some_and(|t| contains_ignore_case(t, needle));
    in_title
        || note.is_some_and(|n| {
            n.title.as_deref().is_some_and(|t| contains_ignore_case(t, needle))
                || n.comment.as_deref().is_some_and(|c| contains_ignore_case(c, needle))
        })
}

fn sort_records(records: &mut [SessionRecord], order: SortOrder) {
    match order {
        SortOrder::UpdatedDesc => records.sort_by_key(|r| (Reverse(r.last_updated_at), r.id.clone())),
        SortOrder::UpdatedAsc => records.sort_by_key(|r| (r.last_updated_at, r.id.clone())),
        SortOrder::CreatedDesc => records.sort_by_key(|r| (Reverse(r.created_at), r.id.clone())),
        SortOrder::CreatedAsc => records.sort_by_key(|r| (r.created_at, r.id.clone())),
        SortOrder::SizeDesc => records.sort_by_key(|r| (Reverse(r.file_size), r.id.clone())),
        SortOrder::EventsDesc => records.sort_by_key(|r| (Reverse(r.total_events), r.id.clone())),
    }
}

fn group_by_day(records: Vec<SessionRecord>, dimension: DateDimension, zone: DayZone) -> Vec<DaySection> {
    let mut sections: Vec<DaySection> = Vec::new();
    let mut index: HashMap<NaiveDate, usize> = HashMap::new();

    for record in records {
        let date = record.date_for(dimension, zone);
        let slot = *index.entry(date).or_insert_with(|| {
            sections.push(DaySection {
                date,
                records: Vec::new(),
                total_duration: chrono::Duration::zero(),
                total_events: 0,
            });
            sections.len() - 1
        });
        let section = &mut sections[slot];
        section.total_duration += record.duration();
        section.total_events += record.total_events;
        section.records.push(record);
    }

    sections.sort_by_key(|s| Reverse(s.date));
    sections
}

/// Run one filter pass. Checks `ticket` once per record in every stage.
pub fn run(input: &FilterInput, ticket: &Ticket) -> Result<FilterOutput, Cancelled> {
    let state = &input.state;
    let mut candidates: Vec<&SessionRecord> = Vec::with_capacity(input.records.len());

    let family = state
        .project
        .as_deref()
        .map(|id| project_family(&input.projects, id));

    let needle = state.query.trim().to_ascii_lowercase();
    let full_text = input
        .search
        .as_ref()
        .filter(|hits| !needle.is_empty() && hits.term.trim().to_ascii_lowercase() == needle);

    // 1. directory prefix
    for record in input.records.iter() {
        ticket.checkpoint()?;
        let keep = match &state.directory {
            Some(dir) => record.cwd.as_deref().is_some_and(|cwd| is_path_prefix(dir, cwd)),
            None => true,
        };
        if keep {
            candidates.push(record);
        }
    }

    // 2. project membership
    if let Some(family) = &family {
        let mut next = Vec::with_capacity(candidates.len());
        for record in candidates {
            ticket.checkpoint()?;
            if in_project(record, family) {
                next.push(record);
            }
        }
        candidates = next;
    }

    // 3. date
    let days: Vec<NaiveDate> = match &state.days {
        DaySelection::None => Vec::new(),
        DaySelection::Single(day) => vec![*day],
        DaySelection::Set(days) => days.iter().copied().collect(),
    };
    if !matches!(state.days, DaySelection::None) {
        let mut next = Vec::with_capacity(candidates.len());
        for record in candidates {
            ticket.checkpoint()?;
            if days
                .iter()
                .any(|day| matches_day(record, *day, state.dimension, input.zone, &input.coverage))
            {
                next.push(record);
            }
        }
        candidates = next;
    }

    // 4 + 5. quick text, or a completed full-text search for the same query
    if !needle.is_empty() {
        let mut next = Vec::with_capacity(candidates.len());
        for record in candidates {
            ticket.checkpoint()?;
            let quick = matches_text(record, &needle, input.notes.get(&record.id));
            let deep = full_text.is_some_and(|hits| hits.ids.contains(&record.id));
            if quick || deep {
                next.push(record);
            }
        }
        candidates = next;
    }

    // 6. sort
    let mut records: Vec<SessionRecord> = candidates.into_iter().cloned().collect();
    ticket.checkpoint()?;
    sort_records(&mut records, state.sort);

    // 7. group
    let total = records.len();
    let sections = group_by_day(records, state.dimension, input.zone);

    Ok(FilterOutput {
        generation: ticket.generation(),
        state: state.clone(),
        sections,
        total,
    })
}

/// Debounced, cancellable filter passes with the latest result published on a watch channel.
pub struct FilterPipeline {
    task: GenerationalTask,
    debounce: Duration,
    published: Arc<watch::Sender<Arc<FilterOutput>>>,
}

impl FilterPipeline {
    pub fn new(debounce: Duration) -> Self {
        let (published, _) = watch::channel(Arc::new(FilterOutput::default()));
        Self {
            task: GenerationalTask::new("filter"),
            debounce,
            published: Arc::new(published),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<FilterOutput>> {
        self.published.subscribe()
    }

    pub fn latest(&self) -> Arc<FilterOutput> {
        Arc::clone(&self.published.borrow())
    }

    /// Cancel any running pass and start one over `input`.
    pub fn submit(&self, input: FilterInput) -> Spawned {
        let published = Arc::clone(&self.published);
        self.task.spawn(
            self.debounce,
            move |ticket| run(&input, ticket),
            move |output| {
                published.send_replace(Arc::new(output));
            },
        )
    }

    /// Run a pass on the calling thread and publish it if still current.
    pub fn run_now(&self, input: FilterInput) -> Result<Arc<FilterOutput>, Cancelled> {
        let ticket = self.task.begin();
        let output = Arc::new(run(&input, &ticket)?);
        self.task
            .apply_if_current(&ticket, || {
                self.published.send_replace(Arc::clone(&output));
            })
            .ok_or(Cancelled)?;
        Ok(output)
    }

    pub fn cancel(&self) {
        self.task.cancel();
    }
}
