use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{BackendClient, BackendError, DependencyRecord, SpecRecord, TaskRecord};
use crate::progress::is_done_status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactCategory {
    SpecDocument,
    Pages,
    Endpoints,
    Schemas,
    NavigationFlow,
    MainTask,
    Subtasks,
}

impl ArtifactCategory {
    pub const ALL: [ArtifactCategory; 7] = [
        ArtifactCategory::SpecDocument,
        ArtifactCategory::Pages,
        ArtifactCategory::Endpoints,
        ArtifactCategory::Schemas,
        ArtifactCategory::NavigationFlow,
        ArtifactCategory::MainTask,
        ArtifactCategory::Subtasks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactCategory::SpecDocument => "spec_document",
            ArtifactCategory::Pages => "pages",
            ArtifactCategory::Endpoints => "endpoints",
            ArtifactCategory::Schemas => "schemas",
            ArtifactCategory::NavigationFlow => "navigation_flow",
            ArtifactCategory::MainTask => "main_task",
            ArtifactCategory::Subtasks => "subtasks",
        }
    }

    fn count_in(&self, spec: &SpecRecord) -> usize {
        match self {
            ArtifactCategory::SpecDocument => non_blank(spec.document.as_deref()),
            ArtifactCategory::Pages => spec.pages.len(),
            ArtifactCategory::Endpoints => spec.endpoints.len(),
            ArtifactCategory::Schemas => spec.schemas.len(),
            ArtifactCategory::NavigationFlow => non_blank(spec.navigation_flow.as_deref()),
            ArtifactCategory::MainTask => non_blank(spec.main_task_id.as_deref()),
            ArtifactCategory::Subtasks => spec
                .subtasks
                .iter()
                .filter(|subtask| subtask.dependencies.is_some())
                .count(),
        }
    }

    fn missing_reason(&self, spec_id: &str) -> String {
        match self {
            ArtifactCategory::SpecDocument => format!("Specification {spec_id} has no document"),
            ArtifactCategory::Pages => format!("Specification {spec_id} defines no pages"),
            ArtifactCategory::Endpoints => format!("Specification {spec_id} defines no endpoints"),
            ArtifactCategory::Schemas => format!("Specification {spec_id} has no schema diagrams"),
            ArtifactCategory::NavigationFlow => {
                format!("Specification {spec_id} has no navigation flow")
            }
            ArtifactCategory::MainTask => format!("Specification {spec_id} is not linked to a main task"),
            ArtifactCategory::Subtasks => {
                format!("Specification {spec_id} has no subtasks with dependency information")
            }
        }
    }
}

fn non_blank(value: Option<&str>) -> usize {
    usize::from(value.is_some_and(|value| !value.trim().is_empty()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub category: ArtifactCategory,
    pub count: usize,
    pub present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub task_id: String,
    pub ready: bool,
    pub missing_artifacts: Vec<String>,
    pub blockers: Vec<String>,
    pub checklist: Vec<ChecklistItem>,
    pub spec_id: Option<String>,
    /// True when part of the check ran on partial data after a transport failure.
    pub degraded: bool,
    pub warnings: Vec<String>,
}

impl ReadinessReport {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            ready: false,
            missing_artifacts: Vec::new(),
            blockers: Vec::new(),
            checklist: Vec::new(),
            spec_id: None,
            degraded: false,
            warnings: Vec::new(),
        }
    }

    fn degrade(&mut self, message: String) {
        warn!(task_id = %self.task_id, "{message}");
        self.degraded = true;
        self.warnings.push(message);
    }

    fn finish(mut self) -> Self {
        self.ready = self.missing_artifacts.is_empty() && self.blockers.is_empty();
        self
    }
}

/// Checks that a task's planning artifacts exist and its dependencies are done.
///
/// Never mutates backend state. Transport failures degrade the check to
/// whatever data was fetched instead of failing it.
pub struct ReadinessValidator<'a> {
    client: BackendClient<'a>,
    done_status: &'a str,
}

impl<'a> ReadinessValidator<'a> {
    pub fn new(client: BackendClient<'a>, done_status: &'a str) -> Self {
        Self {
            client,
            done_status,
        }
    }

    pub fn check(&self, task_id: &str) -> ReadinessReport {
        let mut report = ReadinessReport::new(task_id);

        let task = match self.client.task(task_id) {
            Ok(task) => task,
            Err(BackendError::Unavailable(reason)) => {
                report.degrade(format!(
                    "backend unavailable ({reason}); readiness of {task_id} not verified"
                ));
                return report.finish();
            }
            Err(err) => {
                report.blockers.push(format!("Unable to load task {task_id}: {err}"));
                return report.finish();
            }
        };

        let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
        add_edges(&mut graph, &task.id, &task.dependencies);

        if let Some(spec_id) = task.spec_id.as_deref().filter(|id| !id.trim().is_empty()) {
            report.spec_id = Some(spec_id.to_string());
            self.check_specification(spec_id, &mut report, &mut graph);
        }

        if !task.dependencies.is_empty() {
            self.check_dependencies(&task, &mut report, &mut graph);
        }
        self.expand_dependency_graph(&task.id, &mut report, &mut graph);

        if let Some(cycle) = find_dependency_cycle(&graph, &task.id) {
            report
                .blockers
                .push(format!("Dependency cycle detected: {}", cycle.join(" -> ")));
        }

        let report = report.finish();
        debug!(
            task_id,
            ready = report.ready,
            missing = report.missing_artifacts.len(),
            blockers = report.blockers.len(),
            "readiness checked"
        );
        report
    }

    fn check_specification(
        &self,
        spec_id: &str,
        report: &mut ReadinessReport,
        graph: &mut BTreeMap<String, Vec<String>>,
    ) {
        let spec = match self.client.specification(spec_id) {
            Ok(spec) => spec,
            Err(BackendError::Unavailable(reason)) => {
                report.degrade(format!(
                    "backend unavailable ({reason}); artifacts of specification {spec_id} not verified"
                ));
                return;
            }
            Err(err) => {
                report
                    .missing_artifacts
                    .push(ArtifactCategory::SpecDocument.as_str().to_string());
                report
                    .blockers
                    .push(format!("Linked specification {spec_id} could not be loaded: {err}"));
                return;
            }
        };

        for category in ArtifactCategory::ALL {
            let count = category.count_in(&spec);
            report.checklist.push(ChecklistItem {
                category,
                count,
                present: count > 0,
            });
            if count == 0 {
                report.missing_artifacts.push(category.as_str().to_string());
                report.blockers.push(category.missing_reason(spec_id));
            }
        }

        for subtask in &spec.subtasks {
            if let Some(dependencies) = subtask.dependencies.as_ref() {
                add_edges(graph, &subtask.id, dependencies);
            }
        }
    }

    fn check_dependencies(
        &self,
        task: &TaskRecord,
        report: &mut ReadinessReport,
        graph: &mut BTreeMap<String, Vec<String>>,
    ) {
        let records = match self.client.dependencies(&task.id) {
            Ok(records) => records,
            Err(BackendError::Unavailable(reason)) => {
                report.degrade(format!(
                    "dependency endpoint unavailable ({reason}); checking dependencies one by one"
                ));
                self.fetch_dependencies_individually(task, report, graph)
            }
            Err(err) => {
                report
                    .blockers
                    .push(format!("Unable to resolve dependencies of {}: {err}", task.id));
                return;
            }
        };

        for record in records {
            if !is_done_status(&record.status, self.done_status) {
                report.blockers.push(format!(
                    "Blocked by dependency {} ({}) which is {}",
                    record.title, record.id, record.status
                ));
            }
        }
    }

    /// Follows dependency edges transitively so cycles of any length are seen.
    /// Each reachable task is fetched once; missing tasks end the walk there.
    fn expand_dependency_graph(
        &self,
        start: &str,
        report: &mut ReadinessReport,
        graph: &mut BTreeMap<String, Vec<String>>,
    ) {
        let mut visited = BTreeSet::from([start.to_string()]);
        let mut pending: Vec<String> = graph.get(start).cloned().unwrap_or_default();
        while let Some(id) = pending.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            match self.client.task(&id) {
                Ok(dep) => add_edges(graph, &dep.id, &dep.dependencies),
                Err(BackendError::NotFound { .. }) => {}
                Err(err) => {
                    report.degrade(format!("could not follow dependencies of {id}: {err}"));
                    continue;
                }
            }
            pending.extend(graph.get(&id).into_iter().flatten().cloned());
        }
    }

    /// Degraded path: resolve each declared dependency through the task endpoint.
    fn fetch_dependencies_individually(
        &self,
        task: &TaskRecord,
        report: &mut ReadinessReport,
        graph: &mut BTreeMap<String, Vec<String>>,
    ) -> Vec<DependencyRecord> {
        let mut records = Vec::new();
        for dep_id in &task.dependencies {
            match self.client.task(dep_id) {
                Ok(dep) => {
                    add_edges(graph, &dep.id, &dep.dependencies);
                    records.push(DependencyRecord {
                        id: dep.id,
                        title: dep.title,
                        status: dep.status,
                    });
                }
                Err(BackendError::NotFound { .. }) => records.push(DependencyRecord {
                    id: dep_id.clone(),
                    title: dep_id.clone(),
                    status: "missing".to_string(),
                }),
                Err(err) => {
                    report.degrade(format!("could not verify dependency {dep_id}: {err}"));
                }
            }
        }
        records
    }
}

fn add_edges(graph: &mut BTreeMap<String, Vec<String>>, from: &str, to: &[String]) {
    let edges = graph.entry(from.to_string()).or_default();
    for target in to {
        if !edges.contains(target) {
            edges.push(target.clone());
        }
    }
}

/// Depth-first search from `start` with an explicit recursion path.
///
/// Returns the first cycle reachable from `start` as a closed path, e.g.
/// `["A", "B", "A"]`.
pub fn find_dependency_cycle(graph: &BTreeMap<String, Vec<String>>, start: &str) -> Option<Vec<String>> {
    let mut path = Vec::new();
    let mut on_path = BTreeSet::new();
    let mut finished = BTreeSet::new();
    visit(graph, start, &mut path, &mut on_path, &mut finished)
}

fn visit(
    graph: &BTreeMap<String, Vec<String>>,
    node: &str,
    path: &mut Vec<String>,
    on_path: &mut BTreeSet<String>,
    finished: &mut BTreeSet<String>,
) -> Option<Vec<String>> {
    if on_path.contains(node) {
        let start = path.iter().position(|entry| entry == node)?;
        let mut cycle = path[start..].to_vec();
        cycle.push(node.to_string());
        return Some(cycle);
    }
    if finished.contains(node) {
        return None;
    }

    path.push(node.to_string());
    on_path.insert(node.to_string());
    for next in graph.get(node).into_iter().flatten() {
        if let Some(cycle) = visit(graph, next, path, on_path, finished) {
            return Some(cycle);
        }
    }
    path.pop();
    on_path.remove(node);
    finished.insert(node.to_string());
    None
}
