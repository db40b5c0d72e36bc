//! Text input through ADB Keyboard.
//!
//! Requires ADB Keyboard to be installed on the device.
//! See: https://github.com/nicnocquee/AdbKeyboard

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use tokio::time::sleep;

use super::device::{AdbDevice, AdbError};

const ADB_KEYBOARD_IME: &str = "com.android.adbkeyboard/.AdbIME";
const KEYBOARD_SETTLE: Duration = Duration::from_secs(1);

impl AdbDevice {
    /// Type text into the focused input field.
    pub async fn type_text(&self, text: &str) -> Result<(), AdbError> {
        let encoded = STANDARD.encode(text.as_bytes());
        self.shell(&["am", "broadcast", "-a", "ADB_INPUT_B64", "--es", "msg", &encoded])
            .await?;
        Ok(())
    }

    /// Clear the focused input field.
    pub async fn clear_text(&self) -> Result<(), AdbError> {
        self.shell(&["am", "broadcast", "-a", "ADB_CLEAR_TEXT"])
            .await?;
        Ok(())
    }

    /// Switch to ADB Keyboard if needed, returning the previous IME.
    pub async fn detect_and_set_adb_keyboard(&self) -> Result<String, AdbError> {
        let current = self
            .shell(&["settings", "get", "secure", "default_input_method"])
            .await?
            .trim()
            .to_string();

        if !current.contains(ADB_KEYBOARD_IME) {
            self.shell(&["ime", "set", ADB_KEYBOARD_IME]).await?;
        }
        // Warm up the keyboard
        self.type_text("").await?;
        Ok(current)
    }

    pub async fn restore_keyboard(&self, ime: &str) -> Result<(), AdbError> {
        if ime.is_empty() || ime.contains(ADB_KEYBOARD_IME) {
            return Ok(());
        }
        self.shell(&["ime", "set", ime]).await?;
        Ok(())
    }

    /// Switch keyboard, replace the field content with `text`, switch back.
    pub async fn type_text_with_keyboard_handling(&self, text: &str) -> Result<(), AdbError> {
        let original_ime = self.detect_and_set_adb_keyboard().await?;
        sleep(KEYBOARD_SETTLE).await;

        let typed = async {
            self.clear_text().await?;
            sleep(KEYBOARD_SETTLE).await;
            self.type_text(text).await
        }
        .await;

        // Restore even when typing failed.
        if let Err(e) = self.restore_keyboard(&original_ime).await {
            tracing::warn!("Failed to restore keyboard {}: {}", original_ime, e);
        }
        sleep(KEYBOARD_SETTLE).await;
        typed
    }
}
