//! Plugin engine: named-hook fan-out at fixed pipeline points.
//!
//! Plugins are compiled-in implementations of [`GatewayPlugin`] registered
//! with the engine at startup (or hot-registered through the admin surface).
//! The engine deliberately sees only a narrow view of the gateway: hooks
//! receive a read-only [`HookContext`] and may hand back a partial
//! [`ContextOverride`] that the pipeline merges over the live context. A
//! failing handler is logged and skipped; the remaining handlers still run.

use crate::models::context::RequestContext;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// The fixed hook catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HookKind {
    BeforeRequest,
    AfterRequest,
    BeforeAuth,
    AfterAuth,
    BeforeRouting,
    AfterRouting,
    BeforeCache,
    AfterCache,
    BeforeResponse,
    AfterResponse,
    OnError,
    OnStartup,
    OnShutdown,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::BeforeRequest => "beforeRequest",
            HookKind::AfterRequest => "afterRequest",
            HookKind::BeforeAuth => "beforeAuth",
            HookKind::AfterAuth => "afterAuth",
            HookKind::BeforeRouting => "beforeRouting",
            HookKind::AfterRouting => "afterRouting",
            HookKind::BeforeCache => "beforeCache",
            HookKind::AfterCache => "afterCache",
            HookKind::BeforeResponse => "beforeResponse",
            HookKind::AfterResponse => "afterResponse",
            HookKind::OnError => "onError",
            HookKind::OnStartup => "onStartup",
            HookKind::OnShutdown => "onShutdown",
        }
    }
}

/// Plugin self-description.
#[derive(Debug, Clone, Serialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
}

/// Read-only context slice handed to hook handlers.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub client_ip: String,
    pub service: Option<String>,
    pub instance: Option<String>,
    pub principal_id: Option<String>,
    pub response_status: Option<u16>,
    pub error_kind: Option<&'static str>,
}

impl HookContext {
    fn from_request(ctx: &RequestContext) -> Self {
        Self {
            request_id: ctx.request_id.clone(),
            method: ctx.method.clone(),
            path: ctx.path.clone(),
            client_ip: ctx.client_ip.clone(),
            service: ctx.service.clone(),
            instance: ctx.instance.clone(),
            principal_id: ctx.principal.as_ref().map(|p| p.id.clone()),
            response_status: ctx.response.as_ref().map(|r| r.status.as_u16()),
            error_kind: ctx.records.error_kind,
        }
    }
}

/// Partial context mutation returned by a handler.
#[derive(Debug, Clone, Default)]
pub struct ContextOverride {
    /// Request headers merged over the current set.
    pub headers: HashMap<String, String>,
    /// Query parameters merged over the current set.
    pub query: HashMap<String, String>,
}

impl ContextOverride {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.query.is_empty()
    }
}

/// A compiled-in gateway plugin.
pub trait GatewayPlugin: Send + Sync {
    fn metadata(&self) -> PluginMetadata;

    /// The hooks this plugin subscribes to.
    fn hooks(&self) -> Vec<HookKind>;

    /// Invoked for each subscribed hook. Returning `Ok(Some(..))` merges the
    /// override into the live context; `Err` is logged and isolated.
    fn on_hook(
        &self,
        hook: HookKind,
        ctx: &HookContext,
    ) -> Result<Option<ContextOverride>, String>;

    /// Invoked when the plugin is unloaded.
    fn cleanup(&self) {}
}

/// The hook engine.
pub struct PluginEngine {
    /// Plugins in registration order.
    plugins: RwLock<Vec<Arc<dyn GatewayPlugin>>>,
    /// Hook -> subscribed plugins, in registration order.
    listeners: RwLock<HashMap<HookKind, Vec<Arc<dyn GatewayPlugin>>>>,
}

impl PluginEngine {
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(Vec::new()),
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a plugin and subscribes its declared hooks.
    pub fn register(&self, plugin: Arc<dyn GatewayPlugin>) {
        let metadata = plugin.metadata();
        info!("Registering plugin {} v{}", metadata.name, metadata.version);

        let mut listeners = self.listeners.write().unwrap();
        for hook in plugin.hooks() {
            listeners.entry(hook).or_default().push(plugin.clone());
        }
        self.plugins.write().unwrap().push(plugin);
    }

    /// Unloads a plugin by name, invoking its cleanup handler.
    pub fn unload(&self, name: &str) -> bool {
        let removed = {
            let mut plugins = self.plugins.write().unwrap();
            let before = plugins.len();
            let mut unloaded = None;
            plugins.retain(|p| {
                if p.metadata().name == name {
                    unloaded = Some(p.clone());
                    false
                } else {
                    true
                }
            });
            if plugins.len() == before {
                return false;
            }
            unloaded
        };

        let mut listeners = self.listeners.write().unwrap();
        for handlers in listeners.values_mut() {
            handlers.retain(|p| p.metadata().name != name);
        }
        drop(listeners);

        if let Some(plugin) = removed {
            plugin.cleanup();
            info!("Unloaded plugin {}", name);
        }
        true
    }

    /// Unloads and re-registers a plugin in one step.
    pub fn reload(&self, plugin: Arc<dyn GatewayPlugin>) {
        let name = plugin.metadata().name;
        self.unload(&name);
        self.register(plugin);
    }

    /// Fires a hook against the live request context. Overrides returned by
    /// handlers are merged in registration order.
    pub fn fire(&self, hook: HookKind, ctx: &mut RequestContext) {
        let handlers = {
            let listeners = self.listeners.read().unwrap();
            match listeners.get(&hook) {
                Some(handlers) if !handlers.is_empty() => handlers.clone(),
                _ => return,
            }
        };

        let view = HookContext::from_request(ctx);
        for plugin in handlers {
            match plugin.on_hook(hook, &view) {
                Ok(Some(override_)) if !override_.is_empty() => {
                    debug!(
                        "Plugin {} override on {}",
                        plugin.metadata().name,
                        hook.as_str()
                    );
                    for (name, value) in override_.headers {
                        ctx.set_header(&name, value);
                    }
                    for (name, value) in override_.query {
                        ctx.query.insert(name, value);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    // Fail-isolated: a broken plugin never breaks the request.
                    warn!(
                        "Plugin {} failed on {}: {}",
                        plugin.metadata().name,
                        hook.as_str(),
                        e
                    );
                }
            }
        }
    }

    /// Fires `onStartup` for every plugin in registration order.
    pub fn fire_startup(&self) {
        let ctx = HookContext {
            request_id: String::new(),
            method: String::new(),
            path: String::new(),
            client_ip: String::new(),
            service: None,
            instance: None,
            principal_id: None,
            response_status: None,
            error_kind: None,
        };
        for plugin in self.plugins.read().unwrap().iter() {
            if plugin.hooks().contains(&HookKind::OnStartup) {
                if let Err(e) = plugin.on_hook(HookKind::OnStartup, &ctx) {
                    warn!("Plugin {} startup failed: {}", plugin.metadata().name, e);
                }
            }
        }
    }

    /// Fires `onShutdown` in reverse registration order.
    pub fn fire_shutdown(&self) {
        let ctx = HookContext {
            request_id: String::new(),
            method: String::new(),
            path: String::new(),
            client_ip: String::new(),
            service: None,
            instance: None,
            principal_id: None,
            response_status: None,
            error_kind: None,
        };
        for plugin in self.plugins.read().unwrap().iter().rev() {
            if plugin.hooks().contains(&HookKind::OnShutdown) {
                if let Err(e) = plugin.on_hook(HookKind::OnShutdown, &ctx) {
                    warn!("Plugin {} shutdown failed: {}", plugin.metadata().name, e);
                }
            }
        }
    }

    /// Metadata for every registered plugin, in registration order.
    pub fn list(&self) -> Vec<PluginMetadata> {
        self.plugins
            .read()
            .unwrap()
            .iter()
            .map(|p| p.metadata())
            .collect()
    }
}

impl Default for PluginEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingPlugin {
        name: String,
        hooks: Vec<HookKind>,
        calls: Arc<Mutex<Vec<String>>>,
        fail: bool,
        cleaned: Arc<AtomicUsize>,
    }

    impl GatewayPlugin for RecordingPlugin {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata {
                name: self.name.clone(),
                version: "1.0.0".into(),
                description: "test plugin".into(),
                author: "tests".into(),
            }
        }

        fn hooks(&self) -> Vec<HookKind> {
            self.hooks.clone()
        }

        fn on_hook(
            &self,
            hook: HookKind,
            _ctx: &HookContext,
        ) -> Result<Option<ContextOverride>, String> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, hook.as_str()));
            if self.fail {
                return Err("boom".into());
            }
            Ok(None)
        }

        fn cleanup(&self) {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn plugin(
        name: &str,
        hooks: Vec<HookKind>,
        calls: Arc<Mutex<Vec<String>>>,
        fail: bool,
    ) -> Arc<RecordingPlugin> {
        Arc::new(RecordingPlugin {
            name: name.into(),
            hooks,
            calls,
            fail,
            cleaned: Arc::new(AtomicUsize::new(0)),
        })
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let engine = PluginEngine::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        engine.register(plugin("first", vec![HookKind::BeforeAuth], calls.clone(), false));
        engine.register(plugin("second", vec![HookKind::BeforeAuth], calls.clone(), false));

        let mut ctx = RequestContext::new("127.0.0.1", "GET", "/api/users");
        engine.fire(HookKind::BeforeAuth, &mut ctx);

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["first:beforeAuth", "second:beforeAuth"]
        );
    }

    #[test]
    fn test_failing_handler_is_isolated() {
        let engine = PluginEngine::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        engine.register(plugin("bad", vec![HookKind::BeforeCache], calls.clone(), true));
        engine.register(plugin("good", vec![HookKind::BeforeCache], calls.clone(), false));

        let mut ctx = RequestContext::new("127.0.0.1", "GET", "/");
        engine.fire(HookKind::BeforeCache, &mut ctx);

        // Both ran despite the first one failing.
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_override_merges_into_context() {
        struct HeaderPlugin;
        impl GatewayPlugin for HeaderPlugin {
            fn metadata(&self) -> PluginMetadata {
                PluginMetadata {
                    name: "headers".into(),
                    version: "1.0.0".into(),
                    description: String::new(),
                    author: String::new(),
                }
            }
            fn hooks(&self) -> Vec<HookKind> {
                vec![HookKind::BeforeRouting]
            }
            fn on_hook(
                &self,
                _hook: HookKind,
                _ctx: &HookContext,
            ) -> Result<Option<ContextOverride>, String> {
                let mut override_ = ContextOverride::default();
                override_
                    .headers
                    .insert("x-injected".into(), "by-plugin".into());
                Ok(Some(override_))
            }
        }

        let engine = PluginEngine::new();
        engine.register(Arc::new(HeaderPlugin));

        let mut ctx = RequestContext::new("127.0.0.1", "GET", "/");
        engine.fire(HookKind::BeforeRouting, &mut ctx);
        assert_eq!(ctx.header("x-injected"), Some("by-plugin"));
    }

    #[test]
    fn test_unload_runs_cleanup_and_unsubscribes() {
        let engine = PluginEngine::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let p = plugin("temp", vec![HookKind::AfterResponse], calls.clone(), false);
        let cleaned = p.cleaned.clone();
        engine.register(p);

        assert!(engine.unload("temp"));
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert!(!engine.unload("temp"));

        let mut ctx = RequestContext::new("127.0.0.1", "GET", "/");
        engine.fire(HookKind::AfterResponse, &mut ctx);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_shutdown_reverse_order() {
        let engine = PluginEngine::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        engine.register(plugin("a", vec![HookKind::OnShutdown], calls.clone(), false));
        engine.register(plugin("b", vec![HookKind::OnShutdown], calls.clone(), false));

        engine.fire_shutdown();
        assert_eq!(*calls.lock().unwrap(), vec!["b:onShutdown", "a:onShutdown"]);
    }
}
