#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenLockStatus {
    Locked,
    Unlocked,
    Unknown,
    NotSupported,
}

impl ScreenLockStatus {
    /// Only a positive lock report skips work; unknown states let the tick proceed.
    pub fn is_locked(self) -> bool {
        matches!(self, ScreenLockStatus::Locked)
    }
}

#[cfg(target_os = "macos")]
pub fn screen_lock_status() -> ScreenLockStatus {
    use core_foundation::base::{CFRelease, CFTypeRef, TCFType};
    use core_foundation::boolean::CFBoolean;
    use core_foundation::dictionary::CFDictionaryRef;
    use core_foundation::number::CFNumber;
    use core_foundation::string::CFString;

    unsafe {
        let dict: CFDictionaryRef = CGSessionCopyCurrentDictionary();
        if dict.is_null() {
            return ScreenLockStatus::Unknown;
        }

        let key = CFString::new("CGSSessionScreenIsLocked");
        let value: *const std::ffi::c_void =
            core_foundation::dictionary::CFDictionaryGetValue(dict, key.as_concrete_TypeRef() as _);

        // The key is only present in the session dictionary while the screen is locked.
        let status = if value.is_null() {
            ScreenLockStatus::Unlocked
        } else {
            let value_ref = value as CFTypeRef;
            let type_id = core_foundation::base::CFGetTypeID(value_ref);
            if CFBoolean::type_id() == type_id {
                if CFBoolean::wrap_under_get_rule(value_ref as _).into() {
                    ScreenLockStatus::Locked
                } else {
                    ScreenLockStatus::Unlocked
                }
            } else if CFNumber::type_id() == type_id {
                match CFNumber::wrap_under_get_rule(value_ref as _).to_i64() {
                    Some(0) => ScreenLockStatus::Unlocked,
                    Some(_) => ScreenLockStatus::Locked,
                    None => ScreenLockStatus::Unknown,
                }
            } else {
                ScreenLockStatus::Unknown
            }
        };

        CFRelease(dict as _);
        status
    }
}

#[cfg(not(target_os = "macos"))]
pub fn screen_lock_status() -> ScreenLockStatus {
    ScreenLockStatus::NotSupported
}

#[cfg(target_os = "macos")]
#[link(name = "ApplicationServices", kind = "framework")]
unsafe extern "C" {
    fn CGSessionCopyCurrentDictionary() -> core_foundation::dictionary::CFDictionaryRef;
}
