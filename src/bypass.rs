//! 旁路规则匹配
//!
//! 规则语法：可选的 `!` 前缀表示取反；IP 或 CIDR（如 `10.0.0.0/8`）匹配 IP 字面量；
//! 其余视为域名模式，`*` 为通配符，`.example.com` 匹配该域名及其所有子域名。
//! 规则按顺序求值，第一条匹配的规则决定结果，没有规则匹配时不旁路。

use crate::error::{Result, TunnelError};
use ipnetwork::IpNetwork;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// 规则模式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// IP 网段
    Network(IpNetwork),
    /// 域名模式（已转为小写）
    Domain(String),
}

/// 单条旁路规则
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BypassRule {
    pub pattern: Pattern,
    pub negate: bool,
}

impl BypassRule {
    pub fn new(pattern: Pattern, negate: bool) -> Self {
        Self { pattern, negate }
    }

    /// 规则是否命中（不考虑 negate）
    fn hits(&self, host: &Host<'_>) -> bool {
        match (&self.pattern, host) {
            (Pattern::Network(net), Host::Ip(ip)) => net.contains(*ip),
            (Pattern::Domain(pattern), Host::Domain(domain)) => domain_matches(pattern, domain),
            _ => false,
        }
    }
}

impl FromStr for BypassRule {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (negate, body) = match s.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, s),
        };
        if body.is_empty() {
            return Err(TunnelError::config_error(format!(
                "Invalid bypass rule: '{}'",
                s
            )));
        }

        let pattern = match body.parse::<IpNetwork>() {
            Ok(net) => Pattern::Network(net),
            Err(_) => {
                if body.contains('/') || body.contains(':') {
                    return Err(TunnelError::config_error(format!(
                        "Invalid bypass rule: '{}'",
                        s
                    )));
                }
                Pattern::Domain(body.trim_end_matches('.').to_ascii_lowercase())
            }
        };

        Ok(Self { pattern, negate })
    }
}

impl fmt::Display for BypassRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negate {
            write!(f, "!")?;
        }
        match &self.pattern {
            Pattern::Network(net) => write!(f, "{}", net),
            Pattern::Domain(domain) => write!(f, "{}", domain),
        }
    }
}

/// 解析后的目标主机
enum Host<'a> {
    Ip(IpAddr),
    Domain(&'a str),
}

/// 去掉端口与 IPv6 方括号
fn extract_host(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        // [ipv6]:port 或 [ipv6]
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rfind(':') {
        // 仅有一个冒号时才是 host:port，多个冒号是裸 IPv6
        Some(pos) if addr[..pos].find(':').is_none() => &addr[..pos],
        _ => addr,
    }
}

/// 域名模式匹配
fn domain_matches(pattern: &str, domain: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('.') {
        return domain == suffix || domain.ends_with(pattern);
    }
    if pattern.contains('*') {
        return wildcard_match(pattern.as_bytes(), domain.as_bytes());
    }
    pattern == domain
}

/// `*` 通配符匹配（贪婪回溯）
fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while t < text.len() {
        if p < pattern.len() && pattern[p] != b'*' && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

/// 旁路匹配器：有序规则列表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bypass {
    rules: Vec<BypassRule>,
}

impl Bypass {
    pub fn new(rules: Vec<BypassRule>) -> Self {
        Self { rules }
    }

    /// 从规则字符串列表构建
    pub fn parse<S: AsRef<str>>(rules: &[S]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|r| r.as_ref().parse())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[BypassRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 判断目标是否应被旁路；`addr` 可以带端口
    pub fn matches(&self, addr: &str) -> bool {
        let host = extract_host(addr.trim());
        let lowered;
        let host = match host.parse::<IpAddr>() {
            Ok(ip) => Host::Ip(ip),
            Err(_) => {
                lowered = host.trim_end_matches('.').to_ascii_lowercase();
                Host::Domain(&lowered)
            }
        };

        self.rules
            .iter()
            .find(|rule| rule.hits(&host))
            .map(|rule| !rule.negate)
            .unwrap_or(false)
    }
}
