use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use fleet_core::{
    traits::{ExecutionRepository, WorkflowRepository},
    ExecutionStatus, FleetError, FleetResult, Workflow, WorkflowStatus,
};

/// 工作流依赖检查器
///
/// 工作流依赖关系构成有向无环图，在创建或修改工作流时校验，运行期间不再发现环。
pub struct DependencyChecker {
    workflow_repo: Arc<dyn WorkflowRepository>,
    execution_repo: Arc<dyn ExecutionRepository>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyCheckResult {
    pub satisfied: bool,
    pub blocking_workflow: Option<i64>,
    pub reason: Option<String>,
}

impl DependencyCheckResult {
    fn satisfied() -> Self {
        Self {
            satisfied: true,
            blocking_workflow: None,
            reason: None,
        }
    }

    fn blocked(workflow_id: i64, reason: String) -> Self {
        Self {
            satisfied: false,
            blocking_workflow: Some(workflow_id),
            reason: Some(reason),
        }
    }
}

#[async_trait]
pub trait DependencyCheckService: Send + Sync {
    /// 检查设备在前置工作流上的执行是否已经成功
    async fn check_for_device(
        &self,
        workflow: &Workflow,
        device_id: &str,
    ) -> FleetResult<DependencyCheckResult>;

    /// 校验新的依赖关系，自依赖、依赖不存在或成环时返回错误
    async fn validate_dependency(&self, workflow_id: i64, dependency_id: Option<i64>)
        -> FleetResult<()>;

    async fn detect_circular_dependency(
        &self,
        workflow_id: i64,
        dependency_id: i64,
    ) -> FleetResult<bool>;

    /// 直接依赖该工作流的工作流
    async fn dependents_of(&self, workflow_id: i64) -> FleetResult<Vec<Workflow>>;
}

impl DependencyChecker {
    pub fn new(
        workflow_repo: Arc<dyn WorkflowRepository>,
        execution_repo: Arc<dyn ExecutionRepository>,
    ) -> Self {
        Self {
            workflow_repo,
            execution_repo,
        }
    }

    async fn build_dependency_graph(&self) -> FleetResult<HashMap<i64, Vec<i64>>> {
        let mut graph = HashMap::new();
        for workflow in self.workflow_repo.list_all().await? {
            graph.insert(
                workflow.id,
                workflow.depends_on_workflow_id.into_iter().collect(),
            );
        }
        Ok(graph)
    }
}

/// Kahn 拓扑排序，存在无法处理的节点即说明有环
pub fn has_cycle(graph: &HashMap<i64, Vec<i64>>) -> bool {
    let mut in_degree: HashMap<i64, usize> = HashMap::new();
    let mut queue = VecDeque::new();
    for &node in graph.keys() {
        in_degree.entry(node).or_insert(0);
    }

    for dependencies in graph.values() {
        for &dep in dependencies {
            *in_degree.entry(dep).or_insert(0) += 1;
        }
    }
    for (&node, &degree) in &in_degree {
        if degree == 0 {
            queue.push_back(node);
        }
    }

    let mut processed_count = 0;
    while let Some(node) = queue.pop_front() {
        processed_count += 1;

        if let Some(dependencies) = graph.get(&node) {
            for &dep in dependencies {
                if let Some(degree) = in_degree.get_mut(&dep) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dep);
                    }
                }
            }
        }
    }
    processed_count < in_degree.len()
}

#[async_trait]
impl DependencyCheckService for DependencyChecker {
    async fn check_for_device(
        &self,
        workflow: &Workflow,
        device_id: &str,
    ) -> FleetResult<DependencyCheckResult> {
        let Some(dependency_id) = workflow.depends_on_workflow_id else {
            return Ok(DependencyCheckResult::satisfied());
        };

        match self.execution_repo.find(dependency_id, device_id).await? {
            Some(execution) if execution.status == ExecutionStatus::Completed => {
                debug!(
                    "设备 {} 在前置工作流 {} 上已执行成功",
                    device_id, dependency_id
                );
                Ok(DependencyCheckResult::satisfied())
            }
            Some(execution) => Ok(DependencyCheckResult::blocked(
                dependency_id,
                format!(
                    "设备 {device_id} 在前置工作流 {dependency_id} 上的执行状态为 {}",
                    execution.status
                ),
            )),
            None => Ok(DependencyCheckResult::blocked(
                dependency_id,
                format!("设备 {device_id} 在前置工作流 {dependency_id} 上尚无执行记录"),
            )),
        }
    }

    async fn validate_dependency(
        &self,
        workflow_id: i64,
        dependency_id: Option<i64>,
    ) -> FleetResult<()> {
        let Some(dependency_id) = dependency_id else {
            return Ok(());
        };
        if dependency_id == workflow_id {
            return Err(FleetError::CircularDependency);
        }

        let dependency = self
            .workflow_repo
            .get(dependency_id)
            .await?
            .ok_or_else(|| FleetError::InvalidDependency {
                workflow_id,
                dependency_id,
                reason: "前置工作流不存在".to_string(),
            })?;
        if dependency.status == WorkflowStatus::Cancelled {
            return Err(FleetError::InvalidDependency {
                workflow_id,
                dependency_id,
                reason: "前置工作流已取消".to_string(),
            });
        }

        if workflow_id > 0 && self.detect_circular_dependency(workflow_id, dependency_id).await? {
            return Err(FleetError::CircularDependency);
        }

        Ok(())
    }

    async fn detect_circular_dependency(
        &self,
        workflow_id: i64,
        dependency_id: i64,
    ) -> FleetResult<bool> {
        let mut graph = self.build_dependency_graph().await?;
        graph.insert(workflow_id, vec![dependency_id]);
        let cycle = has_cycle(&graph);

        if cycle {
            warn!(
                "检测到循环依赖，工作流ID: {}, 新依赖: {}",
                workflow_id, dependency_id
            );
        }

        Ok(cycle)
    }

    async fn dependents_of(&self, workflow_id: i64) -> FleetResult<Vec<Workflow>> {
        Ok(self
            .workflow_repo
            .list_all()
            .await?
            .into_iter()
            .filter(|workflow| workflow.depends_on_workflow_id == Some(workflow_id))
            .collect())
    }
}
