use serde::{Deserialize, Serialize};

/// 命令通道的event_type命名空间
pub const COMMAND_EVENT_TYPE: &str = "rudder.command";

/// 运维命令种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Poll,
    ResourceDebug,
    ResourceManage,
    ResourceUpdate,
    ResourceRebuild,
    TenantDebug,
    TenantManage,
    ConfigReload,
    WorkersDebug,
    GlobalDebug,
}

impl CommandKind {
    /// 识别命令名，未知命令返回None由调用方丢弃
    pub fn parse(command: &str) -> Option<Self> {
        match command {
            "poll" => Some(Self::Poll),
            "resource-debug" => Some(Self::ResourceDebug),
            "resource-manage" => Some(Self::ResourceManage),
            "resource-update" => Some(Self::ResourceUpdate),
            "resource-rebuild" => Some(Self::ResourceRebuild),
            "tenant-debug" => Some(Self::TenantDebug),
            "tenant-manage" => Some(Self::TenantManage),
            "config-reload" => Some(Self::ConfigReload),
            "workers-debug" => Some(Self::WorkersDebug),
            "global-debug" => Some(Self::GlobalDebug),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::ResourceDebug => "resource-debug",
            Self::ResourceManage => "resource-manage",
            Self::ResourceUpdate => "resource-update",
            Self::ResourceRebuild => "resource-rebuild",
            Self::TenantDebug => "tenant-debug",
            Self::TenantManage => "tenant-manage",
            Self::ConfigReload => "config-reload",
            Self::WorkersDebug => "workers-debug",
            Self::GlobalDebug => "global-debug",
        }
    }
}

/// 运维命令消息载荷，由外部CLI/API生产
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandPayload {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    /// global-debug 开关：0关闭，其余视为开启
    #[serde(default)]
    pub enabled: Option<u8>,
    /// resource-rebuild 指定的镜像
    #[serde(default)]
    pub image_uuid: Option<String>,
}

impl CommandPayload {
    pub fn kind(&self) -> Option<CommandKind> {
        CommandKind::parse(&self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_commands() {
        for name in [
            "poll",
            "resource-debug",
            "resource-manage",
            "resource-update",
            "resource-rebuild",
            "tenant-debug",
            "tenant-manage",
            "config-reload",
            "workers-debug",
            "global-debug",
        ] {
            let kind = CommandKind::parse(name).unwrap();
            assert_eq!(kind.as_str(), name);
        }
    }

    #[test]
    fn test_parse_unknown_command() {
        assert!(CommandKind::parse("reboot-the-world").is_none());
        assert!(CommandKind::parse("").is_none());
    }

    #[test]
    fn test_payload_deserializes_with_missing_fields() {
        let payload: CommandPayload =
            serde_json::from_str(r#"{"command": "resource-debug", "resource_id": "r1"}"#).unwrap();
        assert_eq!(payload.kind(), Some(CommandKind::ResourceDebug));
        assert_eq!(payload.resource_id.as_deref(), Some("r1"));
        assert!(payload.tenant_id.is_none());
        assert!(payload.enabled.is_none());
    }
}
