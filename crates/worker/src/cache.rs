use std::collections::{HashMap, HashSet};

use rudder_domain::{owner_of, Resource};

/// worker本地的资源缓存
///
/// 两级显式结构：id到资源的持有map，外加一个只存id的租户二级索引。
/// 淘汰必须走显式的 `remove`，同时清理索引项，生命周期之间没有
/// 任何隐式耦合。
#[derive(Debug, Default)]
pub struct ResourceCache {
    by_id: HashMap<String, Resource>,
    tenant_index: HashMap<String, HashSet<String>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一个资源；同id资源换租户时先清掉旧索引项
    pub fn insert(&mut self, resource: Resource) {
        let stale_tenant = self.by_id.get(&resource.id).and_then(|previous| {
            (previous.tenant_id != resource.tenant_id).then(|| previous.tenant_id.clone())
        });
        if let Some(tenant) = stale_tenant {
            self.unindex(&tenant, &resource.id);
        }
        self.tenant_index
            .entry(resource.tenant_id.clone())
            .or_default()
            .insert(resource.id.clone());
        self.by_id.insert(resource.id.clone(), resource);
    }

    pub fn remove(&mut self, id: &str) -> Option<Resource> {
        let resource = self.by_id.remove(id)?;
        self.unindex(&resource.tenant_id, id);
        Some(resource)
    }

    fn unindex(&mut self, tenant_id: &str, id: &str) {
        if let Some(ids) = self.tenant_index.get_mut(tenant_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.tenant_index.remove(tenant_id);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.by_id.get(id)
    }

    /// 某租户名下已知的所有资源
    pub fn tenant_resources(&self, tenant_id: &str) -> Vec<Resource> {
        self.tenant_index
            .get(tenant_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Resource> {
        self.by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.tenant_index.clear();
    }

    /// rebalance后淘汰不再归本节点所有的资源，返回被淘汰的部分
    ///
    /// 归属无法判定的资源（id不是合法标识）保守地留下。
    pub fn evict_not_owned(&mut self, host_id: &str, members: &[String]) -> Vec<Resource> {
        let to_evict: Vec<String> = self
            .by_id
            .values()
            .filter(|resource| {
                matches!(owner_of(&resource.id, members), Some(owner) if owner != host_id)
            })
            .map(|resource| resource.id.clone())
            .collect();

        to_evict
            .iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_tenant_index() {
        let mut cache = ResourceCache::new();
        cache.insert(Resource::router("r1", "t1"));
        cache.insert(Resource::router("r2", "t1"));
        cache.insert(Resource::router("r3", "t2"));

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.tenant_resources("t1").len(), 2);
        assert_eq!(cache.tenant_resources("t2").len(), 1);
        assert!(cache.tenant_resources("t3").is_empty());
    }

    #[test]
    fn test_remove_purges_index() {
        let mut cache = ResourceCache::new();
        cache.insert(Resource::router("r1", "t1"));
        let removed = cache.remove("r1").unwrap();
        assert_eq!(removed.id, "r1");
        assert!(cache.tenant_resources("t1").is_empty());
        assert!(cache.remove("r1").is_none());
    }

    #[test]
    fn test_reinsert_with_new_tenant_moves_index() {
        let mut cache = ResourceCache::new();
        cache.insert(Resource::router("r1", "t1"));
        cache.insert(Resource::router("r1", "t2"));

        assert_eq!(cache.len(), 1);
        assert!(cache.tenant_resources("t1").is_empty());
        assert_eq!(cache.tenant_resources("t2").len(), 1);
    }

    #[test]
    fn test_evict_not_owned() {
        let members = vec!["host-a".to_string(), "host-b".to_string()];
        let mut cache = ResourceCache::new();
        // 构造分别落到两个成员上的uuid
        let id_even = "00000000-0000-0000-0000-000000000002";
        let id_odd = "00000000-0000-0000-0000-000000000003";
        cache.insert(Resource::router(id_even, "t1"));
        cache.insert(Resource::router(id_odd, "t1"));

        let evicted = cache.evict_not_owned("host-a", &members);
        assert_eq!(evicted.len(), 1);
        assert_eq!(cache.len(), 1);
        // 留下的那个归host-a
        for resource in cache.all() {
            assert_eq!(owner_of(&resource.id, &members), Some("host-a"));
        }
    }

    #[test]
    fn test_evict_keeps_unparseable_ids() {
        let members = vec!["host-a".to_string(), "host-b".to_string()];
        let mut cache = ResourceCache::new();
        cache.insert(Resource::router("not-a-uuid", "t1"));
        let evicted = cache.evict_not_owned("host-a", &members);
        assert!(evicted.is_empty());
        assert_eq!(cache.len(), 1);
    }
}
