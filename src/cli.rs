use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "chain-tunnel")]
#[command(author, version, long_about = None)]
#[command(about = "Multi-protocol tunnel with proxy chain routing")]
pub struct Cli {
    /// 省略时按 shadowsocks 插件方式运行
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// 日志级别 (trace, debug, info, warn, error)，可被 RUST_LOG 覆盖
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// 调试输出，等同于 `--log-level debug`
    #[arg(short = 'D', long, global = true)]
    pub debug: bool,

    /// 详细程度（-v debug，-vv trace），优先于 `--log-level`
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// 打印版本的兼容参数，插件宿主以此探测版本
pub fn wants_version<S: AsRef<str>>(args: &[S]) -> bool {
    args.iter()
        .skip(1)
        .any(|arg| matches!(arg.as_ref(), "-PV" | "--PV"))
}

/// 插件模式的命令行：保留原有全局参数，在 `run` 之后追加插件参数
pub fn plugin_args(args: &[String], extra: &[String]) -> Vec<String> {
    let mut full = args.to_vec();
    full.push("run".to_string());
    full.extend_from_slice(extra);
    full
}

impl Cli {
    /// 实际使用的日志过滤级别
    pub fn log_filter(&self) -> &str {
        match (self.verbose, self.debug) {
            (0, false) => &self.log_level,
            (0, true) | (1, _) => "debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 启动服务
    Run {
        /// 配置文件路径
        #[arg(short = 'C', long)]
        config: Option<String>,

        /// 监听地址，例如 socks5://:1080、http://user:pass@:8080、tcp://:2222/10.0.0.5:22
        #[arg(short = 'L', long = "listen", value_name = "URL")]
        listen: Vec<String>,

        /// 转发节点，按出现顺序组成代理链，例如 socks5+tls://proxy:443
        #[arg(short = 'F', long = "forward", value_name = "URL")]
        forward: Vec<String>,

        /// 配置文件变更检测间隔（秒），0 表示不检测
        #[arg(long, default_value_t = 5)]
        reload_interval: u64,
    },
    /// 检查配置文件是否正确
    Check {
        /// 配置文件路径
        #[arg(short = 'C', long)]
        config: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_args() {
        let mut cli = Cli::try_parse_from([
            "chain-tunnel",
            "run",
            "-L",
            "socks5://:1080",
            "-L",
            "http://:8080",
            "-F",
            "socks5://a:1080",
            "-F",
            "http://b:8080",
        ])
        .unwrap();

        match cli.command.take() {
            Some(Commands::Run {
                config,
                listen,
                forward,
                reload_interval,
            }) => {
                assert!(config.is_none());
                assert_eq!(listen, vec!["socks5://:1080", "http://:8080"]);
                assert_eq!(forward, vec!["socks5://a:1080", "http://b:8080"]);
                assert_eq!(reload_interval, 5);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.log_filter(), "info");
    }

    #[test]
    fn test_log_filter_flags() {
        let cli = Cli::try_parse_from(["chain-tunnel", "run", "-D"]).unwrap();
        assert_eq!(cli.log_filter(), "debug");

        let cli = Cli::try_parse_from(["chain-tunnel", "-vv", "run"]).unwrap();
        assert_eq!(cli.log_filter(), "trace");
    }

    #[test]
    fn test_parse_check_args() {
        let cli =
            Cli::try_parse_from(["chain-tunnel", "check", "-C", "tunnel.toml", "-l", "debug"])
                .unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Check { ref config }) if config == "tunnel.toml"
        ));
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_plugin_command_line() {
        let args = vec!["chain-tunnel".to_string(), "-D".to_string()];
        let cli = Cli::try_parse_from(&args).unwrap();
        assert!(cli.command.is_none());

        let extra = vec![
            "-L".to_string(),
            "ss+tcp://none@127.0.0.1:1984".to_string(),
            "-F".to_string(),
            "socks5://proxy:1080".to_string(),
        ];
        let cli = Cli::try_parse_from(plugin_args(&args, &extra)).unwrap();
        assert_eq!(cli.log_filter(), "debug");
        match cli.command {
            Some(Commands::Run { listen, forward, .. }) => {
                assert_eq!(listen, vec!["ss+tcp://none@127.0.0.1:1984"]);
                assert_eq!(forward, vec!["socks5://proxy:1080"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_wants_version() {
        assert!(wants_version(&["chain-tunnel", "-PV"]));
        assert!(wants_version(&["chain-tunnel", "-D", "--PV"]));
        assert!(!wants_version(&["chain-tunnel", "run", "-V"]));
        assert!(!wants_version(&["-PV"]));
    }
}
