use std::sync::Arc;

use grange_core::{
    AuthMetrics, AuthMetricsSnapshot, DefaultPolicy, InterfaceId, MethodOrdinal, Role,
    UserIdentity,
};

/// Declarative authorization rules attachable to a grain class, an
/// interface, or a single method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyRule {
    /// Require a role above `Anonymous`.
    Authorize,
    /// Exempt this method from `Authorize` inherited from the interface
    /// or class. Method-level only.
    AllowAnonymous,
    /// Require at least this role. Multiple requirements OR together.
    RequireRole(Role),
    /// Equivalent to `RequireRole(Server)`; separately named so audits can
    /// tell intent apart.
    ServerOnly,
    /// In strict mode, callers below `Server` may only reach marked
    /// grains, interfaces, or methods.
    ClientAccessible,
}

/// The flattened policy for one `(interface, ordinal)`, resolved from the
/// rules on the method, its interface, and its grain class.
///
/// Resolution happens once at registration time, which doubles as the
/// attribute cache: the hot path never walks rule lists.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub allow_anonymous: bool,
    pub client_accessible: bool,
    /// Collected `RequireRole`/`ServerOnly` requirements; satisfying any
    /// one suffices.
    pub required_roles: Vec<Role>,
    pub has_authorize: bool,
}

impl ResolvedPolicy {
    pub fn resolve(
        class: &[PolicyRule],
        interface: &[PolicyRule],
        method: &[PolicyRule],
    ) -> Self {
        let all = || class.iter().chain(interface).chain(method);

        let mut required_roles = Vec::new();
        for rule in all() {
            match rule {
                PolicyRule::RequireRole(role) => required_roles.push(*role),
                PolicyRule::ServerOnly => required_roles.push(Role::Server),
                _ => {}
            }
        }

        ResolvedPolicy {
            allow_anonymous: method.contains(&PolicyRule::AllowAnonymous),
            client_accessible: all().any(|r| *r == PolicyRule::ClientAccessible),
            required_roles,
            has_authorize: all().any(|r| *r == PolicyRule::Authorize),
        }
    }
}

/// Everything an authorizer gets to look at for one inbound request.
pub struct AuthContext<'a> {
    pub identity: &'a UserIdentity,
    pub grain_type: &'a str,
    pub interface_id: &'a InterfaceId,
    pub method: &'a str,
    pub ordinal: MethodOrdinal,
    pub policy: &'a ResolvedPolicy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied { reason: String },
}

impl Decision {
    pub fn denied(reason: impl Into<String>) -> Self {
        Decision::Denied {
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// The single capability the pipeline is defined by. The default
/// implementation is the declarative-rule evaluator; hosts may prepend
/// filters or replace the evaluator wholesale.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, ctx: &AuthContext<'_>) -> Decision;
}

/// Default evaluator implementing the declarative resolution order.
pub struct PolicyAuthorizer {
    pub default_policy: DefaultPolicy,
    pub enforce_client_accessible: bool,
}

impl Authorizer for PolicyAuthorizer {
    fn authorize(&self, ctx: &AuthContext<'_>) -> Decision {
        let policy = ctx.policy;
        let role = ctx.identity.role;

        // 1. An explicit anonymous exemption wins outright.
        if policy.allow_anonymous {
            return Decision::Allowed;
        }

        // 2. Strict mode: below-Server callers need the accessible mark.
        if self.enforce_client_accessible
            && role < Role::Server
            && !policy.client_accessible
        {
            return Decision::denied(format!(
                "{} is not client accessible",
                ctx.interface_id
            ));
        }

        // 3. Role requirements OR together.
        if !policy.required_roles.is_empty() {
            if policy.required_roles.iter().any(|r| role.satisfies(*r)) {
                return Decision::Allowed;
            }
            let weakest = policy
                .required_roles
                .iter()
                .copied()
                .min()
                .unwrap_or(Role::Admin);
            return Decision::denied(format!("role below {}", weakest));
        }

        // 4. Bare Authorize: anything above Anonymous.
        if policy.has_authorize {
            return if role > Role::Anonymous {
                Decision::Allowed
            } else {
                Decision::denied("authorization required")
            };
        }

        // 5. No policy matched; fall through to the configured default.
        match self.default_policy {
            DefaultPolicy::Permissive => Decision::Allowed,
            DefaultPolicy::DenyByDefault => Decision::denied("denied by default policy"),
        }
    }
}

/// Filters run first (any denial is final), then the evaluator decides.
pub struct AuthPipeline {
    filters: Vec<Arc<dyn Authorizer>>,
    evaluator: Arc<dyn Authorizer>,
    metrics: AuthMetrics,
}

impl AuthPipeline {
    pub fn new(evaluator: Arc<dyn Authorizer>, filters: Vec<Arc<dyn Authorizer>>) -> Self {
        AuthPipeline {
            filters,
            evaluator,
            metrics: AuthMetrics::default(),
        }
    }

    pub fn authorize(&self, ctx: &AuthContext<'_>) -> Decision {
        for filter in &self.filters {
            if let Decision::Denied { reason } = filter.authorize(ctx) {
                return self.record(ctx, Decision::Denied { reason });
            }
        }
        let decision = self.evaluator.authorize(ctx);
        self.record(ctx, decision)
    }

    fn record(&self, ctx: &AuthContext<'_>, decision: Decision) -> Decision {
        match &decision {
            Decision::Allowed => {
                self.metrics.allowed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::debug!(
                    method = %ctx.method,
                    user_id = %ctx.identity.user_id,
                    role = %ctx.identity.role,
                    "authorized"
                );
            }
            Decision::Denied { reason } => {
                self.metrics.denied.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::warn!(
                    method = %ctx.method,
                    user_id = %ctx.identity.user_id,
                    role = %ctx.identity.role,
                    reason = %reason,
                    "authorization denied"
                );
            }
        }
        decision
    }

    pub fn metrics(&self) -> AuthMetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(
        identity: &'a UserIdentity,
        interface_id: &'a InterfaceId,
        policy: &'a ResolvedPolicy,
    ) -> AuthContext<'a> {
        AuthContext {
            identity,
            grain_type: "Admin",
            interface_id,
            method: "Shutdown",
            ordinal: MethodOrdinal(2),
            policy,
        }
    }

    fn permissive() -> PolicyAuthorizer {
        PolicyAuthorizer {
            default_policy: DefaultPolicy::Permissive,
            enforce_client_accessible: false,
        }
    }

    fn strict() -> PolicyAuthorizer {
        PolicyAuthorizer {
            default_policy: DefaultPolicy::DenyByDefault,
            enforce_client_accessible: true,
        }
    }

    fn user(role: Role) -> UserIdentity {
        UserIdentity::new("u1", "alice", role, 1)
    }

    #[test]
    fn resolve_collects_roles_across_levels() {
        let policy = ResolvedPolicy::resolve(
            &[PolicyRule::RequireRole(Role::Admin)],
            &[PolicyRule::ServerOnly],
            &[PolicyRule::RequireRole(Role::User)],
        );
        assert_eq!(
            policy.required_roles,
            vec![Role::Admin, Role::Server, Role::User]
        );
    }

    #[test]
    fn allow_anonymous_is_method_level_only() {
        let policy = ResolvedPolicy::resolve(&[], &[PolicyRule::AllowAnonymous], &[]);
        assert!(!policy.allow_anonymous);
        let policy = ResolvedPolicy::resolve(&[], &[], &[PolicyRule::AllowAnonymous]);
        assert!(policy.allow_anonymous);
    }

    #[test]
    fn require_role_denies_below() {
        let id = InterfaceId::new("game.Admin");
        let policy = ResolvedPolicy::resolve(&[], &[], &[PolicyRule::RequireRole(Role::Admin)]);
        let identity = user(Role::User);
        let decision = permissive().authorize(&ctx(&identity, &id, &policy));
        assert_eq!(decision, Decision::denied("role below Admin"));
    }

    #[test]
    fn require_role_allows_at_or_above() {
        let id = InterfaceId::new("game.Admin");
        let policy = ResolvedPolicy::resolve(&[], &[], &[PolicyRule::RequireRole(Role::User)]);
        for role in [Role::User, Role::Server, Role::Admin] {
            let identity = user(role);
            assert!(permissive().authorize(&ctx(&identity, &id, &policy)).is_allowed());
        }
    }

    #[test]
    fn multiple_role_requirements_or_together() {
        let id = InterfaceId::new("game.Admin");
        let policy = ResolvedPolicy::resolve(
            &[],
            &[],
            &[
                PolicyRule::RequireRole(Role::Admin),
                PolicyRule::RequireRole(Role::Guest),
            ],
        );
        let identity = user(Role::Guest);
        assert!(permissive().authorize(&ctx(&identity, &id, &policy)).is_allowed());
    }

    #[test]
    fn allow_anonymous_overrides_inherited_authorize() {
        let id = InterfaceId::new("game.Info");
        let policy = ResolvedPolicy::resolve(
            &[],
            &[PolicyRule::Authorize],
            &[PolicyRule::AllowAnonymous],
        );
        let identity = UserIdentity::anonymous(1);
        assert!(permissive().authorize(&ctx(&identity, &id, &policy)).is_allowed());
    }

    #[test]
    fn authorize_requires_above_anonymous() {
        let id = InterfaceId::new("game.Info");
        let policy = ResolvedPolicy::resolve(&[PolicyRule::Authorize], &[], &[]);

        let anon = UserIdentity::anonymous(1);
        assert!(!permissive().authorize(&ctx(&anon, &id, &policy)).is_allowed());

        let guest = user(Role::Guest);
        assert!(permissive().authorize(&ctx(&guest, &id, &policy)).is_allowed());
    }

    #[test]
    fn strict_mode_blocks_unmarked_interfaces_for_clients() {
        let id = InterfaceId::new("game.Internal");
        let policy = ResolvedPolicy::default();
        let identity = user(Role::User);
        let decision = strict().authorize(&ctx(&identity, &id, &policy));
        assert_eq!(
            decision,
            Decision::denied("game.Internal is not client accessible")
        );
    }

    #[test]
    fn strict_mode_lets_servers_through_the_mark() {
        let id = InterfaceId::new("game.Internal");
        let policy = ResolvedPolicy::default();
        // Role Server skips the accessibility check but still hits the
        // deny-by-default fallthrough.
        let identity = user(Role::Server);
        let decision = strict().authorize(&ctx(&identity, &id, &policy));
        assert_eq!(decision, Decision::denied("denied by default policy"));
    }

    #[test]
    fn strict_mode_with_mark_and_role() {
        let id = InterfaceId::new("game.Chat");
        let policy = ResolvedPolicy::resolve(
            &[PolicyRule::ClientAccessible],
            &[],
            &[PolicyRule::RequireRole(Role::User)],
        );
        let identity = user(Role::User);
        assert!(strict().authorize(&ctx(&identity, &id, &policy)).is_allowed());
    }

    #[test]
    fn default_policy_fallthrough() {
        let id = InterfaceId::new("game.Open");
        let policy = ResolvedPolicy::default();
        let identity = UserIdentity::anonymous(1);
        assert!(permissive().authorize(&ctx(&identity, &id, &policy)).is_allowed());
        assert!(!strict().authorize(&ctx(&identity, &id, &policy)).is_allowed());
    }

    #[test]
    fn pipeline_filters_deny_first() {
        struct DenyBots;
        impl Authorizer for DenyBots {
            fn authorize(&self, ctx: &AuthContext<'_>) -> Decision {
                if ctx.identity.user_name.starts_with("bot-") {
                    Decision::denied("bots are not welcome")
                } else {
                    Decision::Allowed
                }
            }
        }

        let pipeline = AuthPipeline::new(Arc::new(permissive()), vec![Arc::new(DenyBots)]);
        let id = InterfaceId::new("game.Open");
        let policy = ResolvedPolicy::default();

        let bot = UserIdentity::new("b1", "bot-7", Role::User, 1);
        assert!(!pipeline.authorize(&ctx(&bot, &id, &policy)).is_allowed());

        let human = user(Role::User);
        assert!(pipeline.authorize(&ctx(&human, &id, &policy)).is_allowed());
        assert_eq!(pipeline.metrics().denied, 1);
        assert_eq!(pipeline.metrics().allowed, 1);
    }
}
