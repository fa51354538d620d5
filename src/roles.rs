//! Chat author role resolution
//!
//! Derives broadcaster/moderator/subscriber/vip from Twitch message tags
//! and badges. Best-effort by design: the moderation executor re-checks
//! moderator status against Helix before acting.

use std::collections::HashMap;
use std::collections::HashSet;

/// Roles of a chat author within one channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Roles {
    pub broadcaster: bool,
    pub moderator: bool,
    pub subscriber: bool,
    pub vip: bool,
}

impl Roles {
    /// Resolve roles from message tags and the channel name.
    ///
    /// Rules, in order: author == channel implies broadcaster; badge
    /// prefixes (founder counts as subscriber); tag flag fallbacks.
    pub fn resolve(tags: &HashMap<String, String>, author: &str, channel: &str) -> Self {
        let mut roles = Roles::default();

        if author.eq_ignore_ascii_case(channel) {
            roles.broadcaster = true;
        }

        if let Some(badges) = tags.get("badges") {
            for badge in badges.split(',') {
                match badge.split('/').next().unwrap_or("") {
                    "broadcaster" => roles.broadcaster = true,
                    "moderator" => roles.moderator = true,
                    "vip" => roles.vip = true,
                    "subscriber" | "founder" => roles.subscriber = true,
                    _ => {}
                }
            }
        }

        // Tag flag fallbacks for clients that omit badges
        if tags.get("mod").map(String::as_str) == Some("1") {
            roles.moderator = true;
        }
        if tags.get("subscriber").map(String::as_str) == Some("1") {
            roles.subscriber = true;
        }
        if tags.get("vip").map(String::as_str) == Some("1") {
            roles.vip = true;
        }
        if tags.get("user-type").map(String::as_str) == Some("mod") {
            roles.moderator = true;
        }

        roles
    }
}

/// Process-level admin set plus role predicates. Exemption is part of the
/// safety contract and intentionally not configurable per channel.
#[derive(Debug, Clone, Default)]
pub struct RoleResolver {
    super_admins: HashSet<String>,
}

impl RoleResolver {
    pub fn new(super_admins: HashSet<String>) -> Self {
        Self { super_admins }
    }

    pub fn is_super_admin(&self, login: &str) -> bool {
        self.super_admins.contains(&login.to_lowercase())
    }

    /// Never time out broadcasters, moderators, subscribers, or admins.
    pub fn is_exempt(&self, login: &str, roles: Roles) -> bool {
        roles.broadcaster || roles.moderator || roles.subscriber || self.is_super_admin(login)
    }

    /// May reconfigure the channel's policy.
    pub fn is_privileged(&self, login: &str, roles: Roles) -> bool {
        roles.broadcaster || roles.moderator || self.is_super_admin(login)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_author_is_broadcaster() {
        let roles = Roles::resolve(&tags(&[]), "streamer", "streamer");
        assert!(roles.broadcaster);
    }

    #[test]
    fn test_badge_roles() {
        let roles = Roles::resolve(&tags(&[("badges", "moderator/1,subscriber/12")]), "user", "streamer");
        assert!(roles.moderator);
        assert!(roles.subscriber);
        assert!(!roles.broadcaster);
    }

    #[test]
    fn test_founder_counts_as_subscriber() {
        let roles = Roles::resolve(&tags(&[("badges", "founder/0")]), "user", "streamer");
        assert!(roles.subscriber);
    }

    #[test]
    fn test_tag_flag_fallbacks() {
        let roles = Roles::resolve(&tags(&[("mod", "1"), ("vip", "1")]), "user", "streamer");
        assert!(roles.moderator);
        assert!(roles.vip);

        let roles = Roles::resolve(&tags(&[("user-type", "mod")]), "user", "streamer");
        assert!(roles.moderator);
    }

    #[test]
    fn test_plain_viewer_has_no_roles() {
        let roles = Roles::resolve(&tags(&[("badges", "premium/1")]), "user", "streamer");
        assert_eq!(roles, Roles::default());
    }

    #[test]
    fn test_exemption_and_privilege() {
        let resolver = RoleResolver::new(["admin".to_string()].into_iter().collect());

        let sub = Roles { subscriber: true, ..Default::default() };
        assert!(resolver.is_exempt("user", sub));
        assert!(!resolver.is_privileged("user", sub));

        let moderator = Roles { moderator: true, ..Default::default() };
        assert!(resolver.is_exempt("user", moderator));
        assert!(resolver.is_privileged("user", moderator));

        // Super-admin needs no roles at all
        assert!(resolver.is_exempt("Admin", Roles::default()));
        assert!(resolver.is_privileged("admin", Roles::default()));

        let vip = Roles { vip: true, ..Default::default() };
        assert!(!resolver.is_exempt("user", vip));
        assert!(!resolver.is_privileged("user", vip));
    }
}
