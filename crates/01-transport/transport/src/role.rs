//! Transfer role negotiation between an output (user) and input (provider).
//!
//! Each side brings a preferred role, possibly mandated, and the set of roles
//! it supports. Mandates win, then preferences, then the first workable pair
//! in role order, which favours pushing data.

use xfer::{PortOptions, PortRole};

/// What one side of a connection is willing to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoleOffer {
    pub role: PortRole,
    pub options: PortOptions,
}

impl RoleOffer {
    pub fn new(role: PortRole, options: PortOptions) -> Self {
        Self { role, options }
    }

    fn supports(&self, role: PortRole) -> bool {
        self.options.supports(role)
    }

    fn mandated(&self) -> bool {
        self.options.mandated()
    }

    /// Replaces an absent preference with the first supported role.
    fn with_default_role(mut self) -> Result<Self, &'static str> {
        if self.role == PortRole::NoRole {
            self.role = self
                .options
                .supported_roles()
                .next()
                .ok_or("port has no transfer roles")?;
        }
        Ok(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NegotiatedRoles {
    pub output: PortRole,
    pub input: PortRole,
}

impl NegotiatedRoles {
    fn new(output: PortRole, input: PortRole) -> Self {
        Self { output, input }
    }
}

pub fn choose_roles(user: RoleOffer, provider: RoleOffer) -> Result<NegotiatedRoles, &'static str> {
    let user = user.with_default_role()?;
    let provider = provider.with_default_role()?;
    let (u, p) = (user.role, provider.role);
    let (u_other, p_other) = (u.complement(), p.complement());

    if provider.mandated() {
        if u == p_other {
            return Ok(NegotiatedRoles::new(u, p));
        }
        if user.mandated() {
            return Err("incompatible mandated transfer roles");
        }
        if user.supports(p_other) {
            return Ok(NegotiatedRoles::new(p_other, p));
        }
        return Err("no compatible role available against mandated role");
    }

    if user.mandated() {
        if p == u_other {
            return Ok(NegotiatedRoles::new(u, p));
        }
        if provider.supports(u_other) {
            return Ok(NegotiatedRoles::new(u, u_other));
        }
        return Err("no compatible role available against mandated role");
    }

    // Preferences on both sides.
    if p == u_other {
        return Ok(NegotiatedRoles::new(u, p));
    }
    if u == PortRole::ActiveFlowControl && provider.supports(PortRole::ActiveMessage) {
        return Ok(NegotiatedRoles::new(u, PortRole::ActiveMessage));
    }
    if u == PortRole::ActiveMessage && provider.supports(PortRole::ActiveFlowControl) {
        return Ok(NegotiatedRoles::new(u, PortRole::ActiveFlowControl));
    }
    if p == PortRole::ActiveFlowControl && user.supports(PortRole::ActiveMessage) {
        return Ok(NegotiatedRoles::new(PortRole::ActiveMessage, p));
    }
    if u == PortRole::ActiveOnly && provider.supports(PortRole::Passive) {
        return Ok(NegotiatedRoles::new(u, PortRole::Passive));
    }
    if p == PortRole::Passive && user.supports(PortRole::ActiveOnly) {
        return Ok(NegotiatedRoles::new(PortRole::ActiveOnly, p));
    }
    if u < p && provider.supports(u_other) {
        return Ok(NegotiatedRoles::new(u, u_other));
    }
    if user.supports(p_other) {
        return Ok(NegotiatedRoles::new(p_other, p));
    }
    if provider.supports(u_other) {
        return Ok(NegotiatedRoles::new(u, u_other));
    }

    PortRole::ALL
        .into_iter()
        .find(|role| user.supports(*role) && provider.supports(role.complement()))
        .map(|role| NegotiatedRoles::new(role, role.complement()))
        .ok_or("no compatible combination of roles exists")
}
