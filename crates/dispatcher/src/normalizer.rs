use serde_json::Value;
use tracing::{debug, warn};

use rudder_domain::{CommandKind, CommandPayload, Crud, Event, Resource, COMMAND_EVENT_TYPE, WILDCARD};

/// 本系统自己回写的状态更新事件，忽略以避免反馈回环
const STATUS_ECHO_EVENT: &str = "routerstatus.update.end";

/// 生命周期事件登记表：event_type到动作的显式映射，启动期固定，
/// 不做任何运行时反射。表外以 `.end` 结尾的事件一律当UPDATE兜底。
const LIFECYCLE_RULES: &[(&str, Crud)] = &[
    ("router.create.end", Crud::Create),
    ("router.update.end", Crud::Update),
    ("router.delete.end", Crud::Delete),
    ("router_interface.create.end", Crud::Update),
    ("router_interface.delete.end", Crud::Update),
    ("subnet.create.end", Crud::Update),
    ("subnet.update.end", Crud::Update),
    ("subnet.delete.end", Crud::Update),
    ("port.create.end", Crud::Update),
    ("port.update.end", Crud::Update),
    ("port.delete.end", Crud::Update),
];

/// 事件里可能内嵌业务对象的字段名，按此顺序探测
const EMBEDDED_OBJECTS: &[&str] = &["router", "port", "subnet", "router_interface"];

/// 把一条原始入站消息归一化为事件，不感兴趣的消息返回None
///
/// 规则按优先级：RPC删除通知 > 命令通道 > 生命周期通知 > 丢弃。
pub fn normalize(body: &Value) -> Option<Event> {
    // RPC形态：router删除调用优先于一切event_type判断
    if let Some(method) = body.get("method").and_then(Value::as_str) {
        return normalize_rpc(method, body);
    }

    let event_type = body.get("event_type").and_then(Value::as_str)?;

    if event_type == COMMAND_EVENT_TYPE {
        return normalize_command(body.get("payload").unwrap_or(&Value::Null));
    }

    if event_type == STATUS_ECHO_EVENT {
        debug!("忽略自身状态回写事件");
        return None;
    }

    let crud = match LIFECYCLE_RULES
        .iter()
        .find(|(name, _)| *name == event_type)
    {
        Some((_, crud)) => *crud,
        // 登记表之外的.end事件按UPDATE兜底，其余全部不感兴趣
        None if event_type.ends_with(".end") => Crud::Update,
        None => {
            debug!("忽略不感兴趣的事件类型: {}", event_type);
            return None;
        }
    };

    let resource = extract_resource(body, crud)?;
    let payload = body.get("payload").cloned().unwrap_or(Value::Null);
    Some(Event::new(resource, crud, payload))
}

fn normalize_rpc(method: &str, body: &Value) -> Option<Event> {
    if method != "router_deleted" {
        debug!("忽略不感兴趣的RPC调用: {}", method);
        return None;
    }
    let args = body.get("args")?;
    let Some(router_id) = args.get("router_id").and_then(Value::as_str) else {
        warn!("router_deleted RPC缺少router_id，丢弃");
        return None;
    };
    // RPC删除不带租户上下文，广播出去让缓存了它的worker清理
    let tenant_id = args
        .get("tenant_id")
        .and_then(Value::as_str)
        .unwrap_or(WILDCARD);
    Some(Event::new(
        Resource::router(router_id, tenant_id),
        Crud::Delete,
        args.clone(),
    ))
}

fn normalize_command(payload: &Value) -> Option<Event> {
    let command: CommandPayload = match serde_json::from_value(payload.clone()) {
        Ok(command) => command,
        Err(e) => {
            warn!("命令载荷无法解析，丢弃: {}", e);
            return None;
        }
    };
    let Some(kind) = command.kind() else {
        warn!("未识别的命令，丢弃: {:?}", command.command);
        return None;
    };

    // poll永远是全局的，载荷里写了什么都不看
    if kind == CommandKind::Poll {
        return Some(Event::poll());
    }

    // 未指定租户的命令默认通配，扇出到每个worker
    let resource = Resource::new(
        command.resource_id.clone().unwrap_or_else(|| WILDCARD.to_string()),
        command.tenant_id.clone().unwrap_or_else(|| WILDCARD.to_string()),
        WILDCARD,
    );
    Some(Event::new(resource, Crud::Command, payload.clone()))
}

/// 从通知信封里抽出资源标识
///
/// 租户优先取内嵌对象自己的tenant_id，信封上的操作上下文租户
/// 只是次选：管理员代租户操作时两者并不一致。
fn extract_resource(body: &Value, crud: Crud) -> Option<Resource> {
    let payload = body.get("payload");
    let embedded = payload.and_then(|p| {
        EMBEDDED_OBJECTS
            .iter()
            .find_map(|key| p.get(*key).filter(|v| v.is_object()))
    });

    let tenant_id = embedded
        .and_then(|obj| obj.get("tenant_id"))
        .or_else(|| payload.and_then(|p| p.get("tenant_id")))
        .or_else(|| body.get("_context_tenant_id"))
        .or_else(|| body.get("tenant_id"))
        .and_then(Value::as_str);
    let Some(tenant_id) = tenant_id else {
        warn!("通知缺少租户标识，丢弃");
        return None;
    };

    // 依赖对象事件可能只能定位到租户；端口上的device_id通常就是router
    let router_id = payload
        .and_then(|p| p.get("router").and_then(|r| r.get("id")))
        .or_else(|| payload.and_then(|p| p.get("router_id")))
        .or_else(|| payload.and_then(|p| p.get("port").and_then(|port| port.get("device_id"))))
        .and_then(Value::as_str)
        .unwrap_or("");

    if router_id.is_empty() && matches!(crud, Crud::Create | Crud::Delete) {
        warn!("生命周期事件缺少资源标识，丢弃");
        return None;
    }

    Some(Resource::router(router_id, tenant_id))
}
