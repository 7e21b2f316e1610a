//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 请求标识与键模板渲染
//!
//! 模板中的 `${name}` 占位符会被替换为：
//! - 内置字段：`tenant_id`、`caller_id`、`method`、`path`、`resource`
//! - 否则在扩展维度表中查找
//!
//! 无法解析的占位符原样保留为 `${name}`，避免不同的逻辑键被折叠成同一个字符串；
//! 未闭合的占位符同样原样保留。

use ahash::AHashMap as HashMap;
use std::fmt;

/// 请求标识
///
/// 不可变值类型，`with_*` 方法返回修改后的副本。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaKey {
    /// 租户
    pub tenant_id: String,
    /// 调用方
    pub caller_id: String,
    /// 方法（HTTP方法或RPC方法名）
    pub method: String,
    /// 路径
    pub path: String,
    /// 资源
    pub resource: String,
    /// 扩展维度
    pub extras: HashMap<String, String>,
}

impl QuotaKey {
    /// 创建空的请求标识
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置租户
    pub fn with_tenant(mut self, tenant_id: &str) -> Self {
        self.tenant_id = tenant_id.to_string();
        self
    }

    /// 设置调用方
    pub fn with_caller(mut self, caller_id: &str) -> Self {
        self.caller_id = caller_id.to_string();
        self
    }

    /// 设置方法
    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    /// 设置路径
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// 设置资源
    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resource = resource.to_string();
        self
    }

    /// 添加扩展维度
    pub fn with_extra(mut self, name: &str, value: &str) -> Self {
        self.extras.insert(name.to_string(), value.to_string());
        self
    }

    /// 按名称查找字段值；空值视为未解析
    pub fn field(&self, name: &str) -> Option<&str> {
        let value = match name {
            "tenant_id" => self.tenant_id.as_str(),
            "caller_id" => self.caller_id.as_str(),
            "method" => self.method.as_str(),
            "path" => self.path.as_str(),
            "resource" => self.resource.as_str(),
            other => self.extras.get(other).map(String::as_str)?,
        };

        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }

    /// 渲染键模板
    ///
    /// # 示例
    /// ```rust
    /// use quotaguard::key::QuotaKey;
    ///
    /// let key = QuotaKey::new().with_tenant("acme").with_extra("region", "eu");
    /// assert_eq!(key.render("tenant:${tenant_id}:${region}"), "tenant:acme:eu");
    /// assert_eq!(key.render("caller:${caller_id}"), "caller:${caller_id}");
    /// ```
    pub fn render(&self, template: &str) -> String {
        self.render_counted(template).0
    }

    /// 渲染键模板，同时返回实际被替换的占位符数量
    pub fn render_counted(&self, template: &str) -> (String, usize) {
        if !template.contains("${") {
            return (template.to_string(), 0);
        }

        let mut out = String::with_capacity(template.len() + 16);
        let mut substituted = 0;
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];

            match after.find('}') {
                Some(end) => {
                    let name = &after[..end];
                    match self.field(name) {
                        Some(value) => {
                            out.push_str(value);
                            substituted += 1;
                        }
                        None => {
                            out.push_str("${");
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    // 未闭合
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);

        (out, substituted)
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tenant={} caller={} method={} path={} resource={}",
            self.tenant_id, self.caller_id, self.method, self.path, self.resource
        )
    }
}

/// 模板是否包含占位符
pub fn has_placeholders(template: &str) -> bool {
    template
        .find("${")
        .is_some_and(|start| template[start + 2..].contains('}'))
}
