/*!
# Drono DevKit - Doublures et utilitaires de test

Bibliothèque pour tester le kernel sans appareil ni broker:
- `MockProbe`: appareils scriptés (vivant, arrêté, bloqué) avec compteurs d'appels
- `MockMqttClient`: publication MQTT enregistrée en mémoire
- `TestHarness`: kernel complet câblé sur les doublures
- `fixtures`: contenus de snapshots réalistes (prefs XML, status.json, logcat)
*/

pub mod fixtures;
pub mod mock_probe;
pub mod mqtt_stub;
pub mod test_utils;

pub use mock_probe::{Liveness, MockProbe};
pub use mqtt_stub::MockMqttClient;
pub use test_utils::{FailingSubscriber, RecordingSubscriber, TestHarness};
