#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationPermission {
    /// Approximate (network based) location
    Coarse,
    /// Precise (GPS) location
    Fine,
}

/// Host supplied authorization predicate
pub trait LocationPermissions: Send + Sync {
    fn is_granted(&self, permission: LocationPermission) -> bool;

    /// Whether both coarse and fine location are granted
    fn is_location_authorized(&self) -> bool {
        self.is_granted(LocationPermission::Coarse) && self.is_granted(LocationPermission::Fine)
    }
}

impl<F: Fn(LocationPermission) -> bool + Send + Sync> LocationPermissions for F {
    fn is_granted(&self, permission: LocationPermission) -> bool {
        self(permission)
    }
}

/// For hosts without a permission model
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl LocationPermissions for AllowAll {
    fn is_granted(&self, _permission: LocationPermission) -> bool {
        true
    }
}
