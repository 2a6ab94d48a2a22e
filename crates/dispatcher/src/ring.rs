use tracing::warn;

use rudder_domain::{parse_identifier, ERROR_SENTINEL, WILDCARD};

/// 按资源标识做一致性哈希的派发规则
///
/// 同一个路由键永远落在同一个worker槽位上；通配键广播到全部槽位；
/// 解析不了的键只丢弃，绝不允许部分或全量扇出。
#[derive(Debug, Clone)]
pub struct HashRing {
    worker_count: usize,
}

impl HashRing {
    pub fn new(worker_count: usize) -> Self {
        Self { worker_count }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// 计算一个路由键的目标worker槽位集合
    pub fn targets(&self, routing_key: &str) -> Vec<usize> {
        if routing_key == WILDCARD || routing_key == ERROR_SENTINEL {
            return (0..self.worker_count).collect();
        }
        match parse_identifier(routing_key) {
            Some(id) => vec![(id % self.worker_count as u128) as usize],
            None => {
                warn!("路由键不是合法的128位标识，消息丢弃: {:?}", routing_key);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TENANT: &str = "9774f7d5-df11-46bf-b9a0-4dbbd6c3452e";

    #[test]
    fn test_hash_is_stable_and_in_range() {
        let ring = HashRing::new(7);
        let first = ring.targets(TENANT);
        assert_eq!(first.len(), 1);
        assert!(first[0] < 7);
        for _ in 0..100 {
            assert_eq!(ring.targets(TENANT), first);
        }
    }

    #[test]
    fn test_wildcard_fans_out_to_all_workers() {
        for n in [1, 3, 16] {
            let ring = HashRing::new(n);
            assert_eq!(ring.targets(WILDCARD), (0..n).collect::<Vec<_>>());
            assert_eq!(ring.targets(ERROR_SENTINEL), (0..n).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_malformed_key_targets_nobody() {
        let ring = HashRing::new(8);
        assert!(ring.targets("not-a-uuid").is_empty());
        assert!(ring.targets("").is_empty());
        assert!(ring.targets("9774f7d5-df11").is_empty());
    }

    #[test]
    fn test_single_worker_gets_everything() {
        let ring = HashRing::new(1);
        assert_eq!(ring.targets(TENANT), vec![0]);
    }
}
