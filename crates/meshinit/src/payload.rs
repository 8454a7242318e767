//! Registration payloads derived from config and the instance snapshot.

use std::collections::BTreeMap;

use tether_core::config::{CheckSettings, GatewaySettings, ProxySettings, DEFAULT_GATEWAY_PORT};
use tether_core::{
    AgentService, Config, HealthCheck, HealthCheckDefinition, ProxyConfig, RegistrationIntent, ServiceAddress,
    ServiceKind, Upstream, WorkloadInstance, HEALTH_CRITICAL, TAGGED_ADDRESS_LAN, TAGGED_ADDRESS_WAN,
};

const SOURCE: &str = "tether";
const PROXY_SUFFIX: &str = "-sidecar-proxy";

/// Configured name, else the family lower-cased (service identities must be
/// lower case).
pub fn service_name(cfg: &Config, inst: &WorkloadInstance) -> String {
    let configured = match &cfg.gateway {
        Some(gw) => gw.name.as_deref(),
        None => cfg.service.name.as_deref(),
    };
    match configured.filter(|n| !n.is_empty()) {
        Some(n) => n.to_string(),
        None => inst.family.as_str().to_lowercase(),
    }
}

pub fn service_id(name: &str, inst: &WorkloadInstance) -> String { format!("{}-{}", name, inst.instance_id) }

/// Instance meta under user meta; user keys win.
fn merged_meta(inst: &WorkloadInstance, user: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut meta = BTreeMap::new();
    meta.insert("instance-id".to_string(), inst.instance_id.clone());
    meta.insert("family".to_string(), inst.family.as_str().to_string());
    meta.insert("source".to_string(), SOURCE.to_string());
    meta.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
    meta
}

pub fn build_intent(cfg: &Config, inst: &WorkloadInstance) -> RegistrationIntent {
    match &cfg.gateway {
        Some(gw) => {
            let gateway = gateway_service(cfg, gw, inst);
            let checks = vec![dataplane_check(&gateway)];
            RegistrationIntent::Gateway { gateway, checks }
        }
        None => {
            let service = typical_service(cfg, inst);
            let service_checks = service_checks(cfg, &service);
            let proxy = proxy_service(&cfg.proxy, &service);
            let proxy_checks = vec![dataplane_check(&proxy)];
            RegistrationIntent::Workload { service, service_checks, proxy, proxy_checks }
        }
    }
}

fn typical_service(cfg: &Config, inst: &WorkloadInstance) -> AgentService {
    let s = &cfg.service;
    let name = service_name(cfg, inst);
    AgentService {
        kind: ServiceKind::Typical,
        id: service_id(&name, inst),
        service: name,
        tags: s.tags.clone(),
        meta: merged_meta(inst, &s.meta),
        port: s.port,
        address: inst.node_address.clone(),
        weights: s.weights,
        enable_tag_override: s.enable_tag_override,
        namespace: s.namespace.clone().unwrap_or_default(),
        partition: s.partition.clone().unwrap_or_default(),
        locality: inst.locality(),
        ..Default::default()
    }
}

fn upstream(u: &tether_core::config::UpstreamSettings) -> Upstream {
    Upstream {
        destination_type: u.destination_type.clone().unwrap_or_else(|| "service".to_string()),
        destination_namespace: u.destination_namespace.clone().unwrap_or_default(),
        destination_partition: u.destination_partition.clone().unwrap_or_default(),
        destination_name: u.destination_name.clone(),
        datacenter: u.datacenter.clone().unwrap_or_default(),
        local_bind_address: u.local_bind_address.clone().unwrap_or_default(),
        local_bind_port: u.local_bind_port,
        config: u.config.clone(),
        mesh_gateway: u.mesh_gateway.clone(),
    }
}

/// Sidecar proxy for `service`; shares its meta, tags, tenancy and locality.
fn proxy_service(p: &ProxySettings, service: &AgentService) -> AgentService {
    AgentService {
        kind: ServiceKind::ConnectProxy,
        id: format!("{}{}", service.id, PROXY_SUFFIX),
        service: format!("{}{}", service.service, PROXY_SUFFIX),
        tags: service.tags.clone(),
        meta: service.meta.clone(),
        port: p.public_listener_port(),
        address: service.address.clone(),
        weights: service.weights,
        enable_tag_override: service.enable_tag_override,
        proxy: Some(ProxyConfig {
            destination_service_name: service.service.clone(),
            destination_service_id: service.id.clone(),
            local_service_port: service.port,
            config: p.config.clone(),
            upstreams: p.upstreams.iter().map(upstream).collect(),
            mesh_gateway: p.mesh_gateway.clone(),
        }),
        namespace: service.namespace.clone(),
        partition: service.partition.clone(),
        locality: service.locality.clone(),
        ..Default::default()
    }
}

fn gateway_service(cfg: &Config, gw: &GatewaySettings, inst: &WorkloadInstance) -> AgentService {
    let name = service_name(cfg, inst);
    let mut svc = AgentService {
        kind: gw.kind.service_kind(),
        id: service_id(&name, inst),
        service: name,
        tags: gw.tags.clone(),
        meta: merged_meta(inst, &gw.meta),
        port: gw.port.filter(|p| *p > 0).unwrap_or(DEFAULT_GATEWAY_PORT),
        address: inst.node_address.clone(),
        namespace: gw.namespace.clone().unwrap_or_default(),
        partition: gw.partition.clone().unwrap_or_default(),
        locality: inst.locality(),
        ..Default::default()
    };
    if svc.kind != ServiceKind::MeshGateway {
        return svc;
    }

    svc.port = DEFAULT_GATEWAY_PORT;
    if let Some(lan) = &gw.lan_address {
        if lan.port > 0 {
            svc.port = lan.port;
        }
        if !lan.address.is_empty() {
            svc.address = lan.address.clone();
            svc.tagged_addresses.insert(
                TAGGED_ADDRESS_LAN.to_string(),
                ServiceAddress { address: lan.address.clone(), port: lan.port },
            );
        }
    }
    if let Some(wan) = gw.wan_address.as_ref().filter(|w| !w.address.is_empty()) {
        let port = if wan.port == 0 { svc.port } else { wan.port };
        svc.tagged_addresses.insert(
            TAGGED_ADDRESS_WAN.to_string(),
            ServiceAddress { address: wan.address.clone(), port },
        );
    }
    svc
}

fn check_for(service: &AgentService, check_id: String, name: String) -> HealthCheck {
    HealthCheck {
        check_id,
        name,
        status: HEALTH_CRITICAL.to_string(),
        service_id: service.id.clone(),
        service_name: service.service.clone(),
        namespace: service.namespace.clone(),
        ..Default::default()
    }
}

fn service_checks(cfg: &Config, service: &AgentService) -> Vec<HealthCheck> {
    let mut checks: Vec<HealthCheck> = cfg
        .health_sync_containers
        .iter()
        .map(|container| {
            let mut c = check_for(service, format!("{}-{}", service.id, container), format!("{} container health", container));
            c.notes = format!("Mirrors the health of container {}", container);
            c
        })
        .collect();
    checks.extend(cfg.service.checks.iter().enumerate().map(|(n, c)| configured_check(service, n, c)));
    checks
}

fn configured_check(service: &AgentService, n: usize, c: &CheckSettings) -> HealthCheck {
    let id = c.check_id.clone().filter(|id| !id.is_empty()).unwrap_or_else(|| format!("{}-check-{}", service.id, n));
    let name = if c.name.is_empty() { id.clone() } else { c.name.clone() };
    let mut check = check_for(service, id, name);
    check.notes = c.notes.clone();
    check.definition = HealthCheckDefinition {
        http: c.http.clone(),
        header: c.header.clone(),
        method: c.method.clone(),
        body: c.body.clone(),
        tls_server_name: c.tls_server_name.clone(),
        tls_skip_verify: c.tls_skip_verify,
        tcp: c.tcp.clone(),
        grpc: c.grpc.clone(),
        grpc_use_tls: c.grpc_use_tls,
        interval: c.interval.clone(),
        timeout: c.timeout.clone(),
    };
    check
}

/// Readiness of the dataplane fronting a proxy or gateway entry.
fn dataplane_check(service: &AgentService) -> HealthCheck {
    check_for(service, format!("{}-dataplane", service.id), "Dataplane readiness".to_string())
}
