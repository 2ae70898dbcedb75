use std::fmt;

/// Maximum interface id length in bytes.
pub const MAX_INTERFACE_ID_LEN: usize = 256;

/// Maximum grain type name length in bytes.
pub const MAX_GRAIN_TYPE_LEN: usize = 256;

/// Maximum method name length in bytes.
pub const MAX_METHOD_NAME_LEN: usize = 128;

/// Error type for registry operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    EmptyInterfaceId,
    InterfaceIdTooLong,
    EmptyGrainType,
    GrainTypeTooLong,
    EmptyMethodName,
    MethodNameTooLong,
    /// Ordinals are u16; an interface cannot carry more methods than that.
    TooManyMethods,
    DuplicateInterface(String),
    DuplicateGrainType(String),
    DuplicateMethod(String),
    /// A binding referenced an interface never added to the builder.
    UnknownInterface(String),
    /// A binding referenced a grain type never added to the builder.
    UnknownGrainType(String),
    /// An interface is already bound to a grain type on this server.
    DuplicateBinding(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::EmptyInterfaceId => write!(f, "interface id cannot be empty"),
            RegistryError::InterfaceIdTooLong => {
                write!(f, "interface id exceeds {} bytes", MAX_INTERFACE_ID_LEN)
            }
            RegistryError::EmptyGrainType => write!(f, "grain type cannot be empty"),
            RegistryError::GrainTypeTooLong => {
                write!(f, "grain type exceeds {} bytes", MAX_GRAIN_TYPE_LEN)
            }
            RegistryError::EmptyMethodName => write!(f, "method name cannot be empty"),
            RegistryError::MethodNameTooLong => {
                write!(f, "method name exceeds {} bytes", MAX_METHOD_NAME_LEN)
            }
            RegistryError::TooManyMethods => {
                write!(f, "interface exceeds {} methods", u16::MAX)
            }
            RegistryError::DuplicateInterface(id) => {
                write!(f, "duplicate interface {}", id)
            }
            RegistryError::DuplicateGrainType(name) => {
                write!(f, "duplicate grain type {}", name)
            }
            RegistryError::DuplicateMethod(name) => {
                write!(f, "duplicate method name {}", name)
            }
            RegistryError::UnknownInterface(id) => {
                write!(f, "interface {} is not registered", id)
            }
            RegistryError::UnknownGrainType(name) => {
                write!(f, "grain type {} is not registered", name)
            }
            RegistryError::DuplicateBinding(id) => {
                write!(f, "interface {} is already bound to a grain type", id)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_offender() {
        let e = RegistryError::DuplicateInterface("game.Ping".into());
        assert!(e.to_string().contains("game.Ping"));

        let e = RegistryError::MethodNameTooLong;
        assert!(e.to_string().contains("128"));
    }
}
