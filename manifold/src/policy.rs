//! The local security policy: an ordered allow/deny rule list consulted by
//! the dispatcher. A rule constrains one operation kind
//! (sending to a destination, receiving from a sender, owning a name,
//! activating a service); the last matching rule wins and the default is
//! allow.

use crate::config::PolicyRuleConfig;
use crate::logging;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Access {
    Allow,
    Deny,
}

#[derive(Debug, Clone)]
enum Predicate {
    SendDestination(String),
    ReceiveSender(String),
    Own(String),
    Activate(String),
}

#[derive(Debug, Clone)]
struct PolicyRule {
    access: Access,
    predicate: Predicate,
}

/// Matches a policy pattern against a concrete name. A pattern ending in
/// `.` constrains a whole prefix; `*` matches everything.
fn name_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if pattern.ends_with('.') {
        return name.starts_with(pattern);
    }

    pattern == name
}

pub struct Policy {
    rules: Vec<PolicyRule>,
    log: logging::Logger,
}

impl Policy {
    /// The empty policy: everything allowed.
    pub fn allow_all() -> Policy {
        Policy {
            rules: Vec::new(),
            log: logging::null(),
        }
    }

    /// Build from the config rule table. Config rows carrying no predicate
    /// or more than one are rejected at load time.
    pub fn from_config<'a, L: Into<Option<&'a logging::Logger>>>(
        rows: &[PolicyRuleConfig],
        log: L,
    ) -> Result<Policy, String> {
        let policy_log = match log.into() {
            Some(log) => log.new(logging::o!("subsystem" => "policy")),
            _ => logging::null(),
        };

        let mut rules = Vec::with_capacity(rows.len());

        for (index, row) in rows.iter().enumerate() {
            let access = match row.access.as_str() {
                "allow" => Access::Allow,
                "deny" => Access::Deny,
                other => {
                    return Err(format!(
                        "policy rule {}: access must be allow or deny, got \"{}\"",
                        index, other
                    ));
                }
            };

            let mut predicates = Vec::new();
            if let Some(ref value) = row.send_destination {
                predicates.push(Predicate::SendDestination(value.clone()));
            }
            if let Some(ref value) = row.receive_sender {
                predicates.push(Predicate::ReceiveSender(value.clone()));
            }
            if let Some(ref value) = row.own {
                predicates.push(Predicate::Own(value.clone()));
            }
            if let Some(ref value) = row.activate {
                predicates.push(Predicate::Activate(value.clone()));
            }

            if predicates.len() != 1 {
                return Err(format!(
                    "policy rule {}: exactly one predicate required, got {}",
                    index,
                    predicates.len()
                ));
            }

            rules.push(PolicyRule {
                access,
                predicate: predicates.pop().unwrap(),
            });
        }

        Ok(Policy {
            rules,
            log: policy_log,
        })
    }

    fn decide<F: Fn(&Predicate) -> bool>(&self, applies: F) -> bool {
        let mut access = Access::Allow;

        for rule in &self.rules {
            if applies(&rule.predicate) {
                access = rule.access;
            }
        }

        access == Access::Allow
    }

    /// May a message be sent to `destination`?
    pub fn allow_send(&self, destination: &str) -> bool {
        let allowed = self.decide(|predicate| match predicate {
            Predicate::SendDestination(pattern) => name_matches(pattern, destination),
            _ => false,
        });

        if !allowed {
            logging::debug!(self.log, "send denied"; "destination" => destination);
        }

        allowed
    }

    /// May a recipient be handed a message from `sender`? Consulted once
    /// per recipient on broadcast fan-out.
    pub fn allow_receive(&self, sender: &str) -> bool {
        let allowed = self.decide(|predicate| match predicate {
            Predicate::ReceiveSender(pattern) => name_matches(pattern, sender),
            _ => false,
        });

        if !allowed {
            logging::debug!(self.log, "receive denied"; "sender" => sender);
        }

        allowed
    }

    /// May a connection own `name`?
    pub fn allow_own(&self, name: &str) -> bool {
        let allowed = self.decide(|predicate| match predicate {
            Predicate::Own(pattern) => name_matches(pattern, name),
            _ => false,
        });

        if !allowed {
            logging::debug!(self.log, "ownership denied"; "name" => name);
        }

        allowed
    }

    /// May `name` be activated on demand?
    pub fn allow_activate(&self, name: &str) -> bool {
        let allowed = self.decide(|predicate| match predicate {
            Predicate::Activate(pattern) => name_matches(pattern, name),
            _ => false,
        });

        if !allowed {
            logging::debug!(self.log, "activation denied"; "name" => name);
        }

        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(access: &str) -> PolicyRuleConfig {
        PolicyRuleConfig {
            access: access.to_string(),
            send_destination: None,
            receive_sender: None,
            own: None,
            activate: None,
        }
    }

    #[test]
    fn test_default_allows_everything() {
        let policy = Policy::allow_all();
        assert!(policy.allow_send("org.example.Svc"));
        assert!(policy.allow_receive(":1.0"));
        assert!(policy.allow_own("org.example.Svc"));
        assert!(policy.allow_activate("org.example.Svc"));
    }

    #[test]
    fn test_last_match_wins() {
        let mut deny = row("deny");
        deny.own = Some("*".to_string());
        let mut allow = row("allow");
        allow.own = Some("org.example.".to_string());

        let policy = Policy::from_config(&[deny, allow], None).unwrap();

        assert!(!policy.allow_own("com.other.Svc"));
        assert!(policy.allow_own("org.example.Svc"));
        // Other operation kinds are untouched by own rules.
        assert!(policy.allow_send("com.other.Svc"));
    }

    #[test]
    fn test_deny_send_exact() {
        let mut deny = row("deny");
        deny.send_destination = Some("org.example.Locked".to_string());

        let policy = Policy::from_config(&[deny], None).unwrap();

        assert!(!policy.allow_send("org.example.Locked"));
        assert!(policy.allow_send("org.example.LockedNot"));
    }

    #[test]
    fn test_receive_and_activate_predicates() {
        let mut no_spy = row("deny");
        no_spy.receive_sender = Some(":1.9".to_string());
        let mut no_spawn = row("deny");
        no_spawn.activate = Some("org.example.".to_string());

        let policy = Policy::from_config(&[no_spy, no_spawn], None).unwrap();

        assert!(!policy.allow_receive(":1.9"));
        assert!(policy.allow_receive(":1.10"));
        assert!(!policy.allow_activate("org.example.Spawnable"));
        assert!(policy.allow_activate("com.other.Spawnable"));
    }

    #[test]
    fn test_config_validation() {
        assert!(Policy::from_config(&[row("maybe")], None).is_err());

        // No predicate at all.
        assert!(Policy::from_config(&[row("allow")], None).is_err());

        // Two predicates on one row.
        let mut double = row("allow");
        double.own = Some("a".to_string());
        double.activate = Some("b".to_string());
        assert!(Policy::from_config(&[double], None).is_err());
    }
}
