//! API endpoint URL builders
//!
//! Query parameters (token, login, priority) are added by the client.

/// Build the URL of an API call
pub fn api_url(base_url: &str, call: &str) -> String {
    format!("{}/api/v1/{}", base_url.trim_end_matches('/'), call)
}

pub fn session_url(base_url: &str) -> String {
    api_url(base_url, "session")
}

pub fn authenticate_url(base_url: &str) -> String {
    api_url(base_url, "session/authenticate")
}

pub fn schema_url(base_url: &str) -> String {
    api_url(base_url, "schema/user/CURRENT")
}

pub fn config_url(base_url: &str) -> String {
    api_url(base_url, "config/list")
}

/// Build object creation URL for one object type
pub fn objects_url(base_url: &str, objecttype: &str) -> String {
    api_url(base_url, &format!("db/{}", objecttype))
}

pub fn pool_url(base_url: &str) -> String {
    api_url(base_url, "pool")
}

pub fn group_url(base_url: &str) -> String {
    api_url(base_url, "group")
}

pub fn user_url(base_url: &str) -> String {
    api_url(base_url, "user")
}

pub fn tags_url(base_url: &str) -> String {
    api_url(base_url, "tags")
}

pub fn collection_url(base_url: &str) -> String {
    api_url(base_url, "collection")
}

pub fn collection_objects_url(base_url: &str, collection_id: i64) -> String {
    api_url(base_url, &format!("collection/objects/{}", collection_id))
}

/// Build collection list URL; without a parent this lists the root collections
pub fn collection_list_url(base_url: &str, parent_id: Option<i64>) -> String {
    match parent_id {
        Some(id) => api_url(base_url, &format!("collection/list/{}", id)),
        None => api_url(base_url, "collection/list"),
    }
}

pub fn search_url(base_url: &str) -> String {
    api_url(base_url, "search")
}

pub fn asset_upload_url(base_url: &str) -> String {
    api_url(base_url, "eas/put")
}

/// Build the asset server keyword search URL
pub fn asset_search_url(eas_url: &str) -> String {
    format!("{}/search/keyword", eas_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url() {
        assert_eq!(
            api_url("http://localhost", "session"),
            "http://localhost/api/v1/session"
        );
        assert_eq!(
            api_url("http://localhost/", "session"),
            "http://localhost/api/v1/session"
        );
    }

    #[test]
    fn test_objects_url() {
        let url = objects_url("https://easydb.example.org", "bilder");
        assert_eq!(url, "https://easydb.example.org/api/v1/db/bilder");
    }

    #[test]
    fn test_collection_urls() {
        assert_eq!(
            collection_objects_url("http://localhost", 12),
            "http://localhost/api/v1/collection/objects/12"
        );
        assert_eq!(
            collection_list_url("http://localhost", None),
            "http://localhost/api/v1/collection/list"
        );
        assert_eq!(
            collection_list_url("http://localhost", Some(3)),
            "http://localhost/api/v1/collection/list/3"
        );
    }

    #[test]
    fn test_asset_urls() {
        assert_eq!(
            asset_upload_url("http://localhost"),
            "http://localhost/api/v1/eas/put"
        );
        assert_eq!(
            asset_search_url("http://eas.local/"),
            "http://eas.local/search/keyword"
        );
    }

    #[test]
    fn test_session_urls() {
        assert_eq!(
            authenticate_url("http://localhost"),
            "http://localhost/api/v1/session/authenticate"
        );
        assert_eq!(
            schema_url("http://localhost"),
            "http://localhost/api/v1/schema/user/CURRENT"
        );
    }
}
