#![no_std]
#![no_main]

use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::rng::Rng;
use esp_hal::rtc_cntl::Rtc;
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::usb_serial_jtag::{UsbSerialJtag, UsbSerialJtagRx};
use esp_hal::Blocking;

extern crate alloc;

use core::cell::RefCell;
use core::fmt::{self, Write};
use embassy_executor::Spawner;
use embassy_net::{Config, Stack, StackResources};
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Timer};
use esp_wifi::wifi::{self, ClientConfiguration, Configuration, WifiController, WifiDevice};
use log::{error, info, warn};
use static_cell::StaticCell;

use cloud_board_rs::cloud::{CloudConfig, CloudContext, CloudSession};
use cloud_board_rs::config;
use cloud_board_rs::console::{Console, ConsoleContext};
use cloud_board_rs::credentials::WifiCredentials;
use cloud_board_rs::esp::{
    self, ChipReset, EfuseIdentity, MqttBridge, MqttRequests, NetStacks, NoUsb,
    PersistentVolume, ProvisioningSocket, RadioLink, RtcPower, SocketBridge, SoftAp, SoftRtcc,
    Station,
};
use cloud_board_rs::hal::{AlarmMask, BlockingI2c, MqttEvents, TransferResult, WifiEvents};
use cloud_board_rs::led_control::{LedBank, Ticker};
use cloud_board_rs::mailbox::Mailbox;
use cloud_board_rs::power::PowerManager;
use cloud_board_rs::provisioning::{Provisioning, ProvisioningCommand, ProvisioningContext};
use cloud_board_rs::sensor::{RtccMirror, SensorControl};
use cloud_board_rs::status::{SensorReadings, Shared, StatusRegisters};
use cloud_board_rs::storage::{DeviceInfo, MassStorage, StorageContext, StorageRequests};
use cloud_board_rs::wifi::{NetworkInfo, WifiContext, WifiLifecycle};

// Add app descriptor for espflash compatibility
esp_bootloader_esp_idf::esp_app_desc!();

// Board-wide state; each machine owns the fields it writes
static STATUS: StatusRegisters = StatusRegisters::new();
static TICKER: Ticker = Ticker::new();
static READINGS: SensorReadings = SensorReadings::new();
static NETWORK_INFO: Shared<NetworkInfo> = Shared::new(NetworkInfo::new());
static DEVICE_INFO: Shared<DeviceInfo> = Shared::new(DeviceInfo::new());
static CLOUD_CONFIG: Shared<CloudConfig> = Shared::new(CloudConfig::empty());
static STORAGE_REQUESTS: StorageRequests = StorageRequests::new();
static RTCC_MIRROR: RtccMirror = RtccMirror::new();
static RTCC_ALARM: Shared<AlarmMask> = Shared::new(AlarmMask::Off);
static I2C_DONE: Mailbox<TransferResult> = Mailbox::new();
static PROVISIONING: Mailbox<ProvisioningCommand> = Mailbox::new();
static WIFI_EVENTS: WifiEvents = Channel::new();
static MQTT_EVENTS: MqttEvents = Channel::new();
static MQTT_REQUESTS: MqttRequests = Channel::new();
static RADIO_LINK: RadioLink = RadioLink::new();
static SOCKET_BRIDGE: SocketBridge = SocketBridge::new();

static CREDENTIALS: StaticCell<Shared<WifiCredentials>> = StaticCell::new();
static WIFI_INIT_CELL: StaticCell<esp_wifi::EspWifiController<'static>> = StaticCell::new();
static STATION_RESOURCES: StaticCell<StackResources<5>> = StaticCell::new();
static AP_RESOURCES: StaticCell<StackResources<3>> = StaticCell::new();

type LedPin = Output<'static>;
type SensorBus = BlockingI2c<'static, I2c<'static, Blocking>>;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    error!("[SYS] {}", info);
    loop {}
}

// Embassy task to run a network stack
#[embassy_executor::task(pool_size = 2)]
async fn net_task(mut runner: embassy_net::Runner<'static, WifiDevice<'static>>) -> ! {
    runner.run().await
}

/// 50 ms tick: advances the LED, sensor and publish cadences
#[embassy_executor::task]
async fn tick_task(mut leds: LedBank<LedPin>) -> ! {
    loop {
        TICKER.tick();
        leds.show(TICKER.levels());
        Timer::after(Duration::from_millis(config::TIMER_RESOLUTION_MS as u64)).await;
    }
}

/// Wi-Fi lifecycle and provisioning share the radio controller
#[embassy_executor::task]
async fn network_task(
    controller: WifiController<'static>,
    station: Stack<'static>,
    access_point: Stack<'static>,
    mac: [u8; 6],
    credentials: &'static Shared<WifiCredentials>,
) -> ! {
    let radio = RefCell::new(controller);

    let mut lifecycle = WifiLifecycle::new(
        Station::new(&radio, &RADIO_LINK),
        NetStacks::new(station, access_point, &RADIO_LINK),
        WifiContext {
            status: &STATUS,
            ticker: &TICKER,
            events: &WIFI_EVENTS,
            credentials,
            provisioning: &PROVISIONING,
            info: &NETWORK_INFO,
        },
    );
    let mut provisioning = Provisioning::new(
        SoftAp::new(&radio, mac),
        ProvisioningSocket::new(&SOCKET_BRIDGE),
        ProvisioningContext {
            status: &STATUS,
            ticker: &TICKER,
            commands: &PROVISIONING,
            credentials,
            storage: &STORAGE_REQUESTS,
        },
    );

    let wifi_every = (config::WIFI_TASK_PERIOD_MS / config::PROV_TASK_PERIOD_MS).max(1);
    let mut pass: u64 = 0;
    loop {
        if RADIO_LINK.take_stop_request() {
            if let Err(e) = radio.borrow_mut().stop() {
                warn!("[WIFI] Radio power-down failed: {:?}", e);
            }
        }
        if pass % wifi_every == 0 {
            lifecycle.step();
        }
        provisioning.step();

        pass = pass.wrapping_add(1);
        Timer::after(Duration::from_millis(config::PROV_TASK_PERIOD_MS)).await;
    }
}

#[embassy_executor::task]
async fn cloud_task() -> ! {
    let mut session = CloudSession::new(
        MqttBridge::new(&MQTT_REQUESTS),
        CloudContext {
            status: &STATUS,
            ticker: &TICKER,
            readings: &READINGS,
            events: &MQTT_EVENTS,
            config: &CLOUD_CONFIG,
        },
    );

    loop {
        session.step();
        Timer::after(Duration::from_millis(config::CLOUD_TASK_PERIOD_MS)).await;
    }
}

#[embassy_executor::task]
async fn sensor_task(bus: SensorBus) -> ! {
    let mut sensors = SensorControl::new(
        bus,
        SoftRtcc::new(&RTCC_ALARM),
        &STATUS,
        &TICKER,
        &READINGS,
        &I2C_DONE,
        &RTCC_MIRROR,
    );

    loop {
        sensors.step();
        Timer::after(Duration::from_millis(config::CTRL_TASK_PERIOD_MS)).await;
    }
}

#[embassy_executor::task]
async fn storage_task(
    volume: PersistentVolume,
    mac: [u8; 6],
    credentials: &'static Shared<WifiCredentials>,
) -> ! {
    let mut storage = MassStorage::new(
        volume,
        NoUsb,
        EfuseIdentity::new(mac),
        ChipReset,
        StorageContext {
            status: &STATUS,
            credentials,
            cloud: &CLOUD_CONFIG,
            requests: &STORAGE_REQUESTS,
            device: &DEVICE_INFO,
        },
    );

    loop {
        storage.step();
        Timer::after(Duration::from_millis(config::MSD_TASK_PERIOD_MS)).await;
    }
}

/// Console output through esp-println
struct SerialOut;

impl Write for SerialOut {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        esp_println::print!("{}", s);
        Ok(())
    }
}

/// Line console on the USB serial/JTAG port
#[embassy_executor::task]
async fn console_task(mut serial: UsbSerialJtagRx<'static, Blocking>, rtc: Rtc<'static>) -> ! {
    let mut console = Console::new(
        PowerManager::new(RtcPower::new(rtc, &RADIO_LINK), &STATUS),
        ChipReset,
        ConsoleContext {
            status: &STATUS,
            readings: &READINGS,
            network: &NETWORK_INFO,
            rtcc: &RTCC_MIRROR,
            device: &DEVICE_INFO,
        },
    );

    let mut line: heapless::String<64> = heapless::String::new();
    let mut rx = [0u8; 16];
    loop {
        let len = serial.drain_rx_fifo(&mut rx);
        for &byte in &rx[..len] {
            match byte {
                b'\r' | b'\n' => {
                    if !line.is_empty() {
                        let _ = console.execute(&line, &mut SerialOut);
                        line.clear();
                    }
                }
                0x20..=0x7E => {
                    if line.push(byte as char).is_err() {
                        warn!("[CMD] Line too long, discarded");
                        line.clear();
                    }
                }
                _ => {}
            }
        }
        Timer::after(Duration::from_millis(20)).await;
    }
}

#[esp_hal_embassy::main]
async fn main(spawner: Spawner) {
    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    // Initialize heap allocator for WiFi and the RAM volume (72KB)
    esp_alloc::heap_allocator!(size: 72 * 1024);
    esp_println::logger::init_logger(log::LevelFilter::Info);
    info!("[SYS] cloud-board {}", cloud_board_rs::VERSION);

    // Initialize embassy time system
    let timer_group0 = TimerGroup::new(peripherals.TIMG0);
    esp_hal_embassy::init(timer_group0.timer0);

    // Buttons are sampled once; holding SW1 at boot forces provisioning
    let sw1 = Input::new(
        peripherals.GPIO9,
        InputConfig::default().with_pull(Pull::Up),
    );
    let sw2 = Input::new(
        peripherals.GPIO10,
        InputConfig::default().with_pull(Pull::Up),
    );
    STATUS.sw1_pressed.set(sw1.is_low());
    STATUS.sw2_pressed.set(sw2.is_low());
    info!(
        "[SYS] Buttons at boot: SW1={} SW2={}",
        STATUS.sw1_pressed.get(),
        STATUS.sw2_pressed.get()
    );

    // LEDs: red GPIO3, green GPIO4, yellow GPIO5, blue GPIO6
    let leds = LedBank::new([
        Output::new(peripherals.GPIO3, Level::Low, OutputConfig::default()),
        Output::new(peripherals.GPIO4, Level::Low, OutputConfig::default()),
        Output::new(peripherals.GPIO5, Level::Low, OutputConfig::default()),
        Output::new(peripherals.GPIO6, Level::Low, OutputConfig::default()),
    ]);

    // Sensor bus: SDA GPIO1, SCL GPIO0
    let i2c = I2c::new(
        peripherals.I2C0,
        I2cConfig::default().with_frequency(Rate::from_khz(100)),
    )
    .expect("I2C configuration")
    .with_sda(peripherals.GPIO1)
    .with_scl(peripherals.GPIO0);

    // Initialize WiFi driver
    let timer_group1 = TimerGroup::new(peripherals.TIMG1);
    let mut rng = Rng::new(peripherals.RNG);
    let seed = (u64::from(rng.random()) << 32) | u64::from(rng.random());
    let wifi_init = WIFI_INIT_CELL.init(
        esp_wifi::init(timer_group1.timer0, rng, peripherals.RADIO_CLK).expect("Wi-Fi init"),
    );
    let (mut controller, interfaces) = wifi::new(wifi_init, peripherals.WIFI).expect("Wi-Fi new");
    let mac = interfaces.ap.mac_address();

    // The radio starts in station mode; the lifecycle waits for it
    if let Err(e) = controller
        .set_configuration(&Configuration::Client(ClientConfiguration::default()))
        .and_then(|()| controller.start())
    {
        error!("[WIFI] Radio start failed: {:?}", e);
    }

    let (station, station_runner) = embassy_net::new(
        interfaces.sta,
        Config::dhcpv4(Default::default()),
        STATION_RESOURCES.init(StackResources::new()),
        seed,
    );
    let (access_point, ap_runner) = embassy_net::new(
        interfaces.ap,
        Config::ipv4_static(esp::access_point_address()),
        AP_RESOURCES.init(StackResources::new()),
        seed ^ 0x5A5A,
    );
    info!("[WIFI] Station and access point stacks created");

    let credentials = CREDENTIALS.init(Shared::new(WifiCredentials::defaults()));
    let rtc = Rtc::new(peripherals.LPWR);
    let (serial, _) = UsbSerialJtag::new(peripherals.USB_DEVICE).split();
    let volume = esp::persistent_volume().expect("credential flash block");

    spawner.must_spawn(net_task(station_runner));
    spawner.must_spawn(net_task(ap_runner));
    spawner.must_spawn(esp::link_watch_task(station, &RADIO_LINK, &WIFI_EVENTS));
    spawner.must_spawn(esp::sntp_task(station, &RADIO_LINK));
    spawner.must_spawn(esp::provisioning_socket_task(access_point, &SOCKET_BRIDGE));
    spawner.must_spawn(esp::mqtt_task(station, &MQTT_REQUESTS, &MQTT_EVENTS));
    spawner.must_spawn(esp::rtcc_alarm_task(&RTCC_ALARM, &STATUS));

    spawner.must_spawn(tick_task(leds));
    spawner.must_spawn(storage_task(volume, mac, credentials));
    spawner.must_spawn(sensor_task(BlockingI2c::new(i2c, &I2C_DONE)));
    spawner.must_spawn(network_task(
        controller,
        station,
        access_point,
        mac,
        credentials,
    ));
    spawner.must_spawn(cloud_task());
    spawner.must_spawn(console_task(serial, rtc));

    info!("[SYS] All tasks spawned");
}
