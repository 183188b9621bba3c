//! Typed requests on top of [`Connection::request`]

use bean_proto::message::{self, Acceleration, LedColor, ScratchBank};
use bean_proto::sketch::SketchMetadata;
use bean_proto::*;

use crate::error::BeanError;
use crate::session::Connection;

impl Connection {
    /// Write bytes to the sketch's serial port
    pub async fn send_serial(&self, data: &[u8]) -> Result<(), BeanError> {
        self.send(MSG_SERIAL_DATA, data.to_vec()).await
    }

    /// Degrees Celsius
    pub async fn read_temperature(&self) -> Result<i8, BeanError> {
        let data = self.request(MSG_CC_TEMP_READ, Vec::new()).await?;
        Ok(message::parse_temperature(&data)?)
    }

    pub async fn read_acceleration(&self) -> Result<Acceleration, BeanError> {
        let data = self.request(MSG_CC_ACCEL_READ, Vec::new()).await?;
        Ok(Acceleration::from_bytes(&data)?)
    }

    pub async fn read_led(&self) -> Result<LedColor, BeanError> {
        let data = self.request(MSG_CC_LED_READ_ALL, Vec::new()).await?;
        Ok(LedColor::from_bytes(&data)?)
    }

    pub async fn set_led(&self, color: LedColor) -> Result<(), BeanError> {
        self.send(MSG_CC_LED_WRITE_ALL, color.to_bytes()).await
    }

    pub async fn read_scratch(&self, bank: ScratchBank) -> Result<Vec<u8>, BeanError> {
        self.request(MSG_BT_GET_SCRATCH, vec![bank.number()]).await
    }

    /// Replace a scratch bank's contents (at most 20 bytes)
    pub async fn set_scratch(&self, bank: ScratchBank, data: &[u8]) -> Result<(), BeanError> {
        self.send(MSG_BT_SET_SCRATCH, bank.write_payload(data)?).await
    }

    pub async fn read_arduino_power(&self) -> Result<bool, BeanError> {
        let data = self.request(MSG_CC_GET_AR_POWER, Vec::new()).await?;
        Ok(message::parse_arduino_power(&data)?)
    }

    pub async fn set_arduino_power(&self, on: bool) -> Result<(), BeanError> {
        self.send(MSG_CC_POWER_ARDUINO, vec![on as u8]).await
    }

    pub async fn read_accelerometer_range(&self) -> Result<u8, BeanError> {
        let data = self.request(MSG_CC_ACCEL_GET_RANGE, Vec::new()).await?;
        Ok(message::parse_byte("accelerometer range", &data)?)
    }

    pub async fn set_accelerometer_range(&self, range: u8) -> Result<(), BeanError> {
        self.send(MSG_CC_ACCEL_SET_RANGE, vec![range]).await
    }

    /// Name, size and upload time of the sketch on the device
    pub async fn read_sketch_metadata(&self) -> Result<SketchMetadata, BeanError> {
        let data = self.request(MSG_BL_GET_META, Vec::new()).await?;
        Ok(SketchMetadata::from_bytes(&data)?)
    }

    /// Battery charge in percent
    pub async fn read_battery_level(&self) -> Result<u8, BeanError> {
        let data = self.request(MSG_CC_BATT_READ, Vec::new()).await?;
        Ok(message::parse_byte("battery level", &data)?)
    }

    /// Echoed back by the device
    pub async fn loopback(&self, data: &[u8]) -> Result<Vec<u8>, BeanError> {
        self.request(MSG_DB_LOOPBACK, data.to_vec()).await
    }

    /// Radio firmware revision from the device information service
    pub async fn read_firmware_version(&self) -> Result<String, BeanError> {
        self.read_string(self.profile().firmware_version).await
    }

    pub async fn read_hardware_version(&self) -> Result<String, BeanError> {
        self.read_string(self.profile().hardware_version).await
    }

    pub async fn read_software_version(&self) -> Result<String, BeanError> {
        self.read_string(self.profile().software_version).await
    }

    /// Report scratch bank changes as [`BeanEvent::ScratchChanged`](crate::BeanEvent::ScratchChanged)
    pub async fn watch_scratch(&self, bank: ScratchBank) -> Result<(), BeanError> {
        let characteristic = self.profile().scratch[bank.number() as usize - 1];
        self.enable_notifications(characteristic).await
    }

    /// Report battery level changes as [`BeanEvent::BatteryLevel`](crate::BeanEvent::BatteryLevel)
    pub async fn watch_battery(&self) -> Result<(), BeanError> {
        self.enable_notifications(self.profile().battery_level).await
    }

    async fn read_string(&self, characteristic: uuid::Uuid) -> Result<String, BeanError> {
        let value = self.read_characteristic(characteristic).await?;
        Ok(String::from_utf8_lossy(&value)
            .trim_end_matches('\0')
            .to_string())
    }
}
