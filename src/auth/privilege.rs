//! Privilege model.
//!
//! Entity sets map to a fixed read/write privilege pair, roles map to
//! static privilege grants, and `Root` dominates everything. The tables
//! are closed; an entity set nobody listed simply has no guarding
//! privilege.

use super::access_context::{AccessContext, AccessType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Root,
    Auth,
    AuthRead,
    Social,
    SocialRead,
    Box,
    BoxRead,
    Message,
    MessageRead,
    Rule,
    RuleRead,
}

impl Privilege {
    /// Whether holding `self` satisfies a requirement of `other`.
    pub fn includes(self, other: Privilege) -> bool {
        if self == other || self == Privilege::Root {
            return true;
        }
        matches!(
            (self, other),
            (Privilege::Auth, Privilege::AuthRead)
                | (Privilege::Social, Privilege::SocialRead)
                | (Privilege::Box, Privilege::BoxRead)
                | (Privilege::Message, Privilege::MessageRead)
                | (Privilege::Rule, Privilege::RuleRead)
        )
    }
}

/// Privilege required to read an entity set.
pub fn necessary_read_privilege(entity_set: &str) -> Option<Privilege> {
    match entity_set {
        "Account" => Some(Privilege::AuthRead),
        "Relation" | "ExtCell" => Some(Privilege::SocialRead),
        "Box" => Some(Privilege::BoxRead),
        "ReceivedMessage" | "SentMessage" => Some(Privilege::MessageRead),
        "Rule" => Some(Privilege::RuleRead),
        _ => None,
    }
}

/// Privilege required to write an entity set.
pub fn necessary_write_privilege(entity_set: &str) -> Option<Privilege> {
    match entity_set {
        "Account" => Some(Privilege::Auth),
        "Relation" | "ExtCell" => Some(Privilege::Social),
        "Box" => Some(Privilege::Box),
        "ReceivedMessage" | "SentMessage" => Some(Privilege::Message),
        "Rule" => Some(Privilege::Rule),
        _ => None,
    }
}

/// Static role grants. Roles not listed grant nothing.
pub fn grants_for_role(role_name: &str) -> &'static [Privilege] {
    match role_name {
        "admin" => &[Privilege::Root],
        "auth-admin" => &[Privilege::Auth],
        "social-admin" => &[Privilege::Social],
        "box-admin" => &[Privilege::Box],
        "message-admin" => &[Privilege::Message],
        "rule-admin" => &[Privilege::Rule],
        "reader" => &[
            Privilege::AuthRead,
            Privilege::SocialRead,
            Privilege::BoxRead,
            Privilege::MessageRead,
            Privilege::RuleRead,
        ],
        _ => &[],
    }
}

/// Unit master short-circuits; everyone else needs a role whose grants
/// cover the privilege.
pub fn has_privilege(ctx: &AccessContext, privilege: Privilege) -> bool {
    if ctx.access_type() == AccessType::UnitMaster {
        return true;
    }
    ctx.roles().iter().any(|role| {
        grants_for_role(&role.name)
            .iter()
            .any(|granted| granted.includes(privilege))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_table_matches_the_contract() {
        assert_eq!(necessary_read_privilege("Account"), Some(Privilege::AuthRead));
        assert_eq!(necessary_read_privilege("Relation"), Some(Privilege::SocialRead));
        assert_eq!(necessary_read_privilege("ExtCell"), Some(Privilege::SocialRead));
        assert_eq!(necessary_read_privilege("Box"), Some(Privilege::BoxRead));
        assert_eq!(
            necessary_read_privilege("ReceivedMessage"),
            Some(Privilege::MessageRead)
        );
        assert_eq!(
            necessary_read_privilege("SentMessage"),
            Some(Privilege::MessageRead)
        );
        assert_eq!(necessary_read_privilege("Rule"), Some(Privilege::RuleRead));
        assert_eq!(necessary_read_privilege("Unknown"), None);
    }

    #[test]
    fn write_table_matches_the_contract() {
        assert_eq!(necessary_write_privilege("Account"), Some(Privilege::Auth));
        assert_eq!(necessary_write_privilege("Relation"), Some(Privilege::Social));
        assert_eq!(necessary_write_privilege("ExtCell"), Some(Privilege::Social));
        assert_eq!(necessary_write_privilege("Box"), Some(Privilege::Box));
        assert_eq!(
            necessary_write_privilege("ReceivedMessage"),
            Some(Privilege::Message)
        );
        assert_eq!(
            necessary_write_privilege("SentMessage"),
            Some(Privilege::Message)
        );
        assert_eq!(necessary_write_privilege("Rule"), Some(Privilege::Rule));
        assert_eq!(necessary_write_privilege("Unknown"), None);
    }

    #[test]
    fn root_includes_everything() {
        for p in [
            Privilege::Auth,
            Privilege::AuthRead,
            Privilege::Social,
            Privilege::SocialRead,
            Privilege::Box,
            Privilege::BoxRead,
            Privilege::Message,
            Privilege::MessageRead,
            Privilege::Rule,
            Privilege::RuleRead,
        ] {
            assert!(Privilege::Root.includes(p));
        }
    }

    #[test]
    fn write_includes_its_read_but_not_the_reverse() {
        assert!(Privilege::Auth.includes(Privilege::AuthRead));
        assert!(!Privilege::AuthRead.includes(Privilege::Auth));
        assert!(Privilege::Message.includes(Privilege::MessageRead));
        assert!(!Privilege::Social.includes(Privilege::BoxRead));
        assert!(Privilege::RuleRead.includes(Privilege::RuleRead));
    }
}
