//! 存储路径工具
//!
//! 注册路径布局为 `{base_path}/{service_name}/{instance_id}`。

/// 拼接父路径与子节点名，保证单一分隔符且以 `/` 开头
pub fn join_path(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    match (parent.is_empty(), child.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", child),
        (false, true) => ensure_leading_slash(parent),
        (false, false) => format!("{}/{}", ensure_leading_slash(parent), child),
    }
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// 父路径；根节点没有父路径
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// 检查路径格式：以 `/` 开头、非根时不以 `/` 结尾、不含空段
pub fn validate_path(path: &str) -> Result<(), String> {
    if !path.starts_with('/') {
        return Err(format!("path must be absolute: {:?}", path));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(format!("path must not end with '/': {:?}", path));
    }
    if path[1..].split('/').any(str::is_empty) {
        return Err(format!("path contains an empty segment: {:?}", path));
    }
    Ok(())
}

/// 以基础路径为根计算服务与实例路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePaths {
    base_path: String,
}

impl ServicePaths {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base_path
    }

    /// `{base_path}/{name}`
    pub fn for_name(&self, name: &str) -> String {
        join_path(&self.base_path, name)
    }

    /// `{base_path}/{name}/{id}`
    pub fn for_instance(&self, name: &str, id: &str) -> String {
        join_path(&self.for_name(name), id)
    }
}
