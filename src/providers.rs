pub mod names;
pub mod android_whatsapp;
pub mod android_telephony;
pub mod android_contacts;
pub mod android_generic_media;
pub mod ios_whatsapp;
pub mod imessage;
pub mod ios_contacts;
