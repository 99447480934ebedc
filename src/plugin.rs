//! Shadowsocks SIP003 插件模式
//!
//! 作为插件启动时，本地监听地址与插件参数由环境变量传入：
//!
//! - `SS_LOCAL_HOST`/`SS_LOCAL_PORT`：shadowsocks 客户端连接的本地地址
//! - `SS_REMOTE_HOST`/`SS_REMOTE_PORT`：远端服务器地址，替换参数中的 `#SS_HOST`/`#SS_PORT`
//! - `SS_PLUGIN_OPTIONS`：以空白分隔的命令行参数，或 `CFGBLOB=<base64 JSON>`
//!
//! `CFGBLOB` 形式携带完整的命令行与附带文件，文件写入 `DataDir` 下的专用目录，
//! 进程随后切换到该目录运行，以便参数用相对路径引用证书等文件。

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CFGBLOB_PREFIX: &str = "CFGBLOB=";

/// 插件文件所在的子目录
const FILES_DIR: &str = "chain_tunnel_files";

/// SIP003 插件环境
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginEnv {
    pub local_host: String,
    pub local_port: String,
    pub remote_host: String,
    pub remote_port: String,
    pub options: String,
}

/// `CFGBLOB` 解码后的内容
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct CfgBlob {
    /// 每项是一个或两个参数，例如 `["-L", "ss://none@#SS_LOCAL_HOST:#SS_LOCAL_PORT"]`
    pub cmd_args: Vec<Vec<String>>,
    pub data_dir: String,
    pub files: BTreeMap<String, String>,
}

/// 插件模式下的启动计划
#[derive(Debug, PartialEq, Eq)]
pub struct PluginPlan {
    /// 追加在 `run` 之后的命令行参数
    pub args: Vec<String>,
    /// 需要写出的附带文件
    pub blob: Option<CfgBlob>,
}

impl PluginEnv {
    /// 读取进程环境，不是以插件方式启动时返回 `None`
    pub fn from_env() -> Option<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let local_host = var("SS_LOCAL_HOST").filter(|v| !v.is_empty())?;
        let local_port = var("SS_LOCAL_PORT").filter(|v| !v.is_empty())?;
        Some(Self {
            local_host,
            local_port,
            remote_host: var("SS_REMOTE_HOST").unwrap_or_default(),
            remote_port: var("SS_REMOTE_PORT").unwrap_or_default(),
            options: var("SS_PLUGIN_OPTIONS").unwrap_or_default(),
        })
    }

    /// shadowsocks 客户端连接的本地监听地址
    fn local_listener(&self) -> String {
        let host = if self.local_host.contains(':') {
            format!("[{}]", self.local_host)
        } else {
            self.local_host.clone()
        };
        format!("ss+tcp://none@{}:{}", host, self.local_port)
    }

    pub fn plan(&self) -> Result<PluginPlan> {
        let encoded = self
            .options
            .split_whitespace()
            .find_map(|option| option.strip_prefix(CFGBLOB_PREFIX));

        if let Some(encoded) = encoded {
            let blob = decode_blob(encoded)?;
            let args = blob
                .cmd_args
                .iter()
                .flatten()
                .map(|arg| {
                    arg.replace("#SS_LOCAL_HOST", &self.local_host)
                        .replace("#SS_LOCAL_PORT", &self.local_port)
                })
                .collect();
            return Ok(PluginPlan {
                args,
                blob: Some(blob),
            });
        }

        let options = self
            .options
            .replace("#SS_HOST", &self.remote_host)
            .replace("#SS_PORT", &self.remote_port);
        let mut args = vec!["-L".to_string(), self.local_listener()];
        args.extend(options.split_whitespace().map(str::to_string));
        Ok(PluginPlan { args, blob: None })
    }
}

/// 解码 `CFGBLOB`，填充字符 `=` 以 `_` 代替
pub fn decode_blob(encoded: &str) -> Result<CfgBlob> {
    let json = STANDARD
        .decode(encoded.replace('_', "="))
        .context("Invalid CFGBLOB encoding")?;
    serde_json::from_slice(&json).context("Invalid CFGBLOB content")
}

impl CfgBlob {
    /// 在 `DataDir` 下重建文件目录并写出附带文件，返回该目录
    pub fn materialize(&self) -> Result<PathBuf> {
        let base = if self.data_dir.is_empty() {
            Path::new(".")
        } else {
            Path::new(&self.data_dir)
        };
        let dir = base.join(FILES_DIR);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Cannot remove stale plugin file {}: {}", path.display(), e);
            }
        }

        for (name, data) in &self.files {
            if name.is_empty() || name.contains(['/', '\\']) || name == ".." {
                bail!("Invalid plugin file name '{}'", name);
            }
            let path = dir.join(name);
            write_private(&path, data.as_bytes())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            debug!("Wrote plugin file {}", path.display());
        }
        Ok(dir)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}
