use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::models::AppConfig;
use crate::{OrchestratorError, OrchestratorResult};

/// 一次重新加载的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReloadOutcome {
    /// 可热更新的字段是否有变化
    pub changed: bool,
    /// 有变化但需要重启才能生效的配置项
    pub restart_required: Vec<String>,
}

struct HandleInner {
    path: Option<PathBuf>,
    tx: watch::Sender<Arc<AppConfig>>,
    // 串行化并发的 reload
    reload_lock: Mutex<()>,
}

/// 运行时配置句柄
///
/// 组件在每次使用时读取 `current()`，或订阅 `subscribe()` 在变更时推送给
/// 熔断器、事件总线等持有内部副本的组件。
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<HandleInner>,
}

impl ConfigHandle {
    pub fn new(config: AppConfig, path: Option<PathBuf>) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self {
            inner: Arc::new(HandleInner {
                path,
                tx,
                reload_lock: Mutex::new(()),
            }),
        }
    }

    /// 不关联配置文件，主要用于测试
    pub fn fixed(config: AppConfig) -> Self {
        Self::new(config, None)
    }

    pub fn current(&self) -> Arc<AppConfig> {
        self.inner.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<AppConfig>> {
        self.inner.tx.subscribe()
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// 从配置文件和环境变量重新加载
    pub fn reload(&self) -> OrchestratorResult<ReloadOutcome> {
        let path = self.inner.path.as_ref().map(|p| p.to_string_lossy().to_string());
        let config = AppConfig::load(path.as_deref())
            .map_err(|e| OrchestratorError::Configuration(format!("{e:#}")))?;
        self.apply(config)
    }

    /// 校验并应用新配置，需要重启的配置项保持原值
    pub fn apply(&self, config: AppConfig) -> OrchestratorResult<ReloadOutcome> {
        config
            .validate()
            .map_err(|e| OrchestratorError::Configuration(format!("{e:#}")))?;

        let _guard = self
            .inner
            .reload_lock
            .lock()
            .map_err(|_| OrchestratorError::internal("配置重载锁已损坏"))?;

        let current = self.current();
        let restart_required: Vec<String> = current
            .restart_required_changes(&config)
            .into_iter()
            .map(str::to_string)
            .collect();
        for item in &restart_required {
            warn!("配置项 {} 已变化，需要重启才能生效", item);
        }

        let effective = config.retain_restart_only(&current);
        let changed = effective != *current;
        if changed {
            self.inner.tx.send_replace(Arc::new(effective));
            info!("配置已热更新");
        }

        Ok(ReloadOutcome {
            changed,
            restart_required,
        })
    }

    /// 监听配置文件变化并自动重新加载，返回的 watcher 被丢弃后停止监听
    pub fn watch_file(&self) -> OrchestratorResult<RecommendedWatcher> {
        let path = self
            .inner
            .path
            .clone()
            .ok_or_else(|| OrchestratorError::Configuration("未指定配置文件，无法监听".into()))?;
        let file_name = path.file_name().map(|n| n.to_os_string());
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let handle = self.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    error!("配置文件监听错误: {}", e);
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            let touches_config = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if !touches_config {
                return;
            }
            match handle.reload() {
                Ok(outcome) if outcome.changed => info!("检测到配置文件变化，已重新加载"),
                Ok(_) => {}
                Err(e) => error!("配置文件重新加载失败: {}", e),
            }
        })
        .map_err(|e| OrchestratorError::Configuration(format!("创建文件监听器失败: {e}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| OrchestratorError::Configuration(format!("监听配置目录失败: {e}")))?;
        info!("开始监听配置文件: {}", path.display());
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_apply_hot_reloadable_change() {
        let handle = ConfigHandle::fixed(AppConfig::default());
        let mut rx = handle.subscribe();

        let mut next = AppConfig::default();
        next.registry.heartbeat_interval_seconds = 5;
        let outcome = handle.apply(next).unwrap();

        assert!(outcome.changed);
        assert!(outcome.restart_required.is_empty());
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            rx.borrow_and_update().registry.liveness_window(),
            std::time::Duration::from_secs(15)
        );
    }

    #[test]
    fn test_restart_only_fields_are_kept() {
        let handle = ConfigHandle::fixed(AppConfig::default());

        let mut next = AppConfig::default();
        next.database.max_connections = 50;
        let outcome = handle.apply(next).unwrap();

        assert!(!outcome.changed);
        assert_eq!(outcome.restart_required, vec!["database".to_string()]);
        assert_eq!(handle.current().database.max_connections, 10);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let handle = ConfigHandle::fixed(AppConfig::default());
        let mut next = AppConfig::default();
        next.resilience.failure_threshold = 0;
        assert!(matches!(
            handle.apply(next),
            Err(OrchestratorError::Configuration(_))
        ));
        assert_eq!(handle.current().resilience.failure_threshold, 5);
    }

    #[test]
    fn test_reload_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.toml");
        std::fs::write(&path, "[engine]\ndefault_max_retries = 1\n").unwrap();

        let initial = AppConfig::load(path.to_str()).unwrap();
        assert_eq!(initial.engine.default_max_retries, 1);
        let handle = ConfigHandle::new(initial, Some(path.clone()));

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[engine]\ndefault_max_retries = 7").unwrap();
        drop(file);

        let outcome = handle.reload().unwrap();
        assert!(outcome.changed);
        assert_eq!(handle.current().engine.default_max_retries, 7);
    }
}
