use std::sync::Arc;

use async_trait::async_trait;

use rudder_core::RudderResult;

use crate::events::Resource;

/// 一条调试标记
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugFlag {
    pub uuid: String,
    pub reason: Option<String>,
}

/// 按uuid区分的调试标记仓储（资源范围、租户范围各实例化一次）
///
/// `enable` 幂等：重复开启同一标识是无操作而不是错误；
/// 并发开启由存储层的唯一约束兜底，重复插入被静默吞掉。
#[async_trait]
pub trait ScopedDebugRepository: Send + Sync {
    async fn enable(&self, uuid: &str, reason: Option<&str>) -> RudderResult<()>;

    async fn disable(&self, uuid: &str) -> RudderResult<()>;

    /// 查询标记状态，返回 `(是否开启, 原因)`，"未开启"不是错误
    async fn status(&self, uuid: &str) -> RudderResult<(bool, Option<String>)>;

    async fn list(&self) -> RudderResult<Vec<DebugFlag>>;
}

/// 全局调试标记仓储（单例开关，最多一条生效记录）
#[async_trait]
pub trait GlobalDebugRepository: Send + Sync {
    async fn enable(&self, reason: Option<&str>) -> RudderResult<()>;

    async fn disable(&self) -> RudderResult<()>;

    async fn status(&self) -> RudderResult<(bool, Option<String>)>;
}

/// 三个范围的调试标记仓储打包，worker执行前统一查询
#[derive(Clone)]
pub struct DebugRegistry {
    pub resources: Arc<dyn ScopedDebugRepository>,
    pub tenants: Arc<dyn ScopedDebugRepository>,
    pub global: Arc<dyn GlobalDebugRepository>,
}

impl DebugRegistry {
    pub fn new(
        resources: Arc<dyn ScopedDebugRepository>,
        tenants: Arc<dyn ScopedDebugRepository>,
        global: Arc<dyn GlobalDebugRepository>,
    ) -> Self {
        Self {
            resources,
            tenants,
            global,
        }
    }

    /// 自动调和是否被调试标记挡住；命中时返回范围与原因的描述
    pub async fn reconciliation_blocked(
        &self,
        resource: &Resource,
    ) -> RudderResult<Option<String>> {
        let (active, reason) = self.global.status().await?;
        if active {
            return Ok(Some(format!(
                "global debug: {}",
                reason.unwrap_or_else(|| "no reason given".to_string())
            )));
        }

        let (active, reason) = self.tenants.status(&resource.tenant_id).await?;
        if active {
            return Ok(Some(format!(
                "tenant {} in debug: {}",
                resource.tenant_id,
                reason.unwrap_or_else(|| "no reason given".to_string())
            )));
        }

        let (active, reason) = self.resources.status(&resource.id).await?;
        if active {
            return Ok(Some(format!(
                "resource {} in debug: {}",
                resource.id,
                reason.unwrap_or_else(|| "no reason given".to_string())
            )));
        }

        Ok(None)
    }
}
