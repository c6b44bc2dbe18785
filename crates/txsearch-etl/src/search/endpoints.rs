//! Search cluster endpoint URL builders

/// Index or comma separated list of indices
pub fn index_url(base_url: &str, index: &str) -> String {
    format!("{}/{}", base_url, index)
}

pub fn refresh_url(base_url: &str, index: &str) -> String {
    format!("{}/{}/_refresh", base_url, index)
}

pub fn aliases_url(base_url: &str, index: &str, alias_pattern: &str) -> String {
    format!("{}/{}/_alias/{}", base_url, index, alias_pattern)
}

pub fn alias_url(base_url: &str, index: &str, alias: &str) -> String {
    format!("{}/{}/_alias/{}", base_url, index, alias)
}

pub fn settings_url(base_url: &str, index: &str) -> String {
    format!("{}/{}/_settings", base_url, index)
}

pub fn template_url(base_url: &str, name: &str) -> String {
    format!("{}/_template/{}", base_url, name)
}

pub fn bulk_url(base_url: &str, index: &str) -> String {
    format!("{}/{}/_bulk", base_url, index)
}

/// Delete-by-query that refreshes afterwards and skips version conflicts
pub fn delete_by_query_url(base_url: &str, index: &str) -> String {
    format!(
        "{}/{}/_delete_by_query?refresh=true&conflicts=proceed",
        base_url, index
    )
}

pub fn count_url(base_url: &str, index: &str) -> String {
    format!("{}/{}/_count", base_url, index)
}

pub fn snapshot_url(base_url: &str, repository: &str, snapshot: &str) -> String {
    format!("{}/_snapshot/{}/{}", base_url, repository, snapshot)
}
