//! Category sets per domain, offered to the model as allowed labels.

/// Canonical domain name for a user-supplied label.
pub fn normalize_domain(domain: &str) -> String {
    let lower = domain.trim().to_lowercase();
    match lower.as_str() {
        "fb_ads" | "facebook-ads" | "facebook_ads" | "fb-ads" | "meta-ads" => "fb_ads".into(),
        "google_ads" | "google-ads" | "googleads" => "google_ads".into(),
        _ => lower,
    }
}

/// Category ids for a domain. Unknown domains get a generic set.
pub fn categories(domain: &str) -> &'static [&'static str] {
    match normalize_domain(domain).as_str() {
        "fb_ads" => &[
            "campaign_management",
            "audience_targeting",
            "ad_creative",
            "pixel_tracking",
            "optimization",
            "policy_compliance",
        ],
        "google_ads" => &[
            "search_ads",
            "display_ads",
            "shopping",
            "bidding",
            "analytics",
            "optimization",
        ],
        _ => &[
            "fundamentals",
            "procedures",
            "tools",
            "strategy",
            "advanced",
            "compliance",
        ],
    }
}
