//! Provider names and their friendly forms, kept together so the generic providers
//! can attribute content to applications they don't themselves parse.

pub const ANDROID_CONTACTS: &str = "android-com.android.providers.contacts";
pub const ANDROID_CONTACTS_FRIENDLY: &str = "Android Contacts";
pub const ANDROID_GENERIC_MEDIA: &str = "android-generic-media";
pub const ANDROID_GENERIC_MEDIA_FRIENDLY: &str = "Android Generic Media";
pub const ANDROID_TELEPHONY: &str = "android-com.android.providers.telephony";
pub const ANDROID_TELEPHONY_FRIENDLY: &str = "Android Telephony";
pub const ANDROID_WHATSAPP: &str = "android-com.whatsapp.android";
pub const ANDROID_WHATSAPP_FRIENDLY: &str = "Android WhatsApp";
pub const ANDROID_CAMERA: &str = "android-com.android.camera";
pub const ANDROID_CAMERA_FRIENDLY: &str = "Android Camera";
pub const ANDROID_CAMERA2_HMDGLOBAL: &str = "android-com.hmdglobal.camera2";
pub const ANDROID_CAMERA2_HMDGLOBAL_FRIENDLY: &str = "Android Camera (HMD Global, Camera2)";
pub const IOS_IMESSAGE: &str = "ios-com.apple.messages";
pub const IOS_IMESSAGE_FRIENDLY: &str = "Apple Messages";
pub const IOS_CONTACTS: &str = "ios-AddressBook";
pub const IOS_CONTACTS_FRIENDLY: &str = "iOS Contacts";
pub const IOS_WHATSAPP: &str = "ios-net.whatsapp.WhatsApp";
pub const IOS_WHATSAPP_FRIENDLY: &str = "iOS WhatsApp";

const FRIENDLY_NAMES: &[(&str, &str)] = &[
    (ANDROID_CONTACTS, ANDROID_CONTACTS_FRIENDLY),
    (ANDROID_GENERIC_MEDIA, ANDROID_GENERIC_MEDIA_FRIENDLY),
    (ANDROID_TELEPHONY, ANDROID_TELEPHONY_FRIENDLY),
    (ANDROID_WHATSAPP, ANDROID_WHATSAPP_FRIENDLY),
    (ANDROID_CAMERA, ANDROID_CAMERA_FRIENDLY),
    (ANDROID_CAMERA2_HMDGLOBAL, ANDROID_CAMERA2_HMDGLOBAL_FRIENDLY),
    (IOS_IMESSAGE, IOS_IMESSAGE_FRIENDLY),
    (IOS_CONTACTS, IOS_CONTACTS_FRIENDLY),
    (IOS_WHATSAPP, IOS_WHATSAPP_FRIENDLY),
];

pub fn friendly_name_for(provider_name: &str) -> Option<&'static str> {
    FRIENDLY_NAMES.iter()
        .find(|(name, _)| *name == provider_name)
        .map(|(_, friendly)| *friendly)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_provider_has_a_friendly_name() {
        for name in [ANDROID_CONTACTS, ANDROID_GENERIC_MEDIA, ANDROID_TELEPHONY, ANDROID_WHATSAPP,
                     ANDROID_CAMERA, ANDROID_CAMERA2_HMDGLOBAL, IOS_IMESSAGE, IOS_CONTACTS,
                     IOS_WHATSAPP] {
            assert!(friendly_name_for(name).is_some(), "No friendly name for {name}");
        }
    }
}
