use std::path::Path;

use dxr_samples::camera::CameraInput;
use dxr_samples::cli::Cli;
use dxr_samples::device::headless::HeadlessDevice;
use dxr_samples::renderer::Renderer;
use dxr_samples::{OrFatal, Result};

const HEADLESS_STEP: f32 = 1.0 / 60.0;

fn init_logging(validation: bool) {
    let level = if validation { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn load_library(cli: &Cli, headless: bool) -> Result<Vec<u8>> {
    match &cli.shaders {
        Some(dir) => cli.sample.load_library(dir),
        None if headless => Ok(Vec::new()),
        None => cli.sample.load_library(Path::new("shaders")),
    }
}

fn run_headless(cli: &Cli, library: Vec<u8>) -> Result<()> {
    let mut renderer = Renderer::new(
        HeadlessDevice::new(),
        cli.sample,
        library,
        cli.width,
        cli.height,
    )?;

    let input = CameraInput::default();

    for _ in 0..cli.frames {
        renderer.frame(&input, HEADLESS_STEP)?;
    }

    renderer.flush()?;

    log::info!(
        "Rendered {} headless frames of `{}` at {}x{}",
        cli.frames,
        cli.sample,
        renderer.target().width(),
        renderer.target().height()
    );

    Ok(())
}

#[cfg(windows)]
mod window {
    use std::sync::Mutex;
    use std::time::Instant;

    use once_cell::sync::Lazy;
    use windows::core::{w, HSTRING};
    use windows::Win32::Foundation::*;
    use windows::Win32::System::Console::AllocConsole;
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::UI::Input::KeyboardAndMouse::*;
    use windows::Win32::UI::WindowsAndMessaging::*;

    use dxr_samples::camera::CameraInput;
    use dxr_samples::cli::Cli;
    use dxr_samples::device::d3d12::{D3d12Device, DeviceOptions};
    use dxr_samples::renderer::Renderer;
    use dxr_samples::{Error, Result};

    /// Client size reported by the last `WM_SIZE`, consumed by the frame loop.
    static PENDING_RESIZE: Lazy<Mutex<Option<(u32, u32)>>> = Lazy::new(|| Mutex::new(None));

    extern "system" fn wndproc(
        window: HWND,
        message: u32,
        wparam: WPARAM,
        lparam: LPARAM,
    ) -> LRESULT {
        match message {
            WM_CLOSE => {
                unsafe { DestroyWindow(window) };
                LRESULT::default()
            }
            WM_DESTROY => {
                unsafe { PostQuitMessage(0) };
                LRESULT::default()
            }
            WM_KEYDOWN => {
                if wparam.0 == VK_ESCAPE.0 as usize {
                    unsafe { PostQuitMessage(0) };
                }
                LRESULT::default()
            }
            WM_SIZE => {
                let width = (lparam.0 & 0xffff) as u32;
                let height = ((lparam.0 >> 16) & 0xffff) as u32;

                if let Ok(mut pending) = PENDING_RESIZE.lock() {
                    *pending = Some((width, height));
                }
                LRESULT::default()
            }
            _ => unsafe { DefWindowProcW(window, message, wparam, lparam) },
        }
    }

    fn create_window(title: &str, width: u32, height: u32) -> Result<HWND> {
        let class_name = w!("DxrSamplesWindowClass");

        let instance = unsafe { GetModuleHandleW(None) }
            .map_err(|e| Error::DeviceCreation(e.to_string()))?;

        let wc = WNDCLASSEXW {
            cbSize: std::mem::size_of::<WNDCLASSEXW>() as u32,
            style: CS_HREDRAW | CS_VREDRAW,
            lpfnWndProc: Some(wndproc),
            hInstance: instance,
            hCursor: unsafe { LoadCursorW(None, IDC_ARROW) }.unwrap_or_default(),
            lpszClassName: class_name,
            ..Default::default()
        };

        if unsafe { RegisterClassExW(&wc) } == 0 {
            return Err(Error::DeviceCreation("RegisterClass() failed".into()));
        }

        // Requested size is the client area
        let mut r = RECT {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        };
        unsafe { AdjustWindowRect(&mut r, WS_OVERLAPPEDWINDOW, false) };

        let title: HSTRING = title.into();

        let hwnd = unsafe {
            CreateWindowExW(
                WINDOW_EX_STYLE::default(),
                class_name,
                &title,
                WS_OVERLAPPEDWINDOW,
                CW_USEDEFAULT,
                CW_USEDEFAULT,
                r.right - r.left,
                r.bottom - r.top,
                None,
                None,
                instance,
                None,
            )
        };

        if hwnd.0 == 0 {
            return Err(Error::DeviceCreation("CreateWindowEx() failed".into()));
        }

        Ok(hwnd)
    }

    fn held(key: u16) -> bool {
        unsafe { GetAsyncKeyState(key as i32) < 0 }
    }

    fn read_input() -> CameraInput {
        CameraInput {
            forward: held(b'W' as u16),
            back: held(b'S' as u16),
            left: held(b'A' as u16),
            right: held(b'D' as u16),
            up: held(b'E' as u16),
            down: held(b'Q' as u16),
            pitch_up: held(VK_UP.0),
            pitch_down: held(VK_DOWN.0),
            yaw_left: held(VK_LEFT.0),
            yaw_right: held(VK_RIGHT.0),
        }
    }

    pub fn alloc_console() {
        unsafe { AllocConsole() };
    }

    pub fn run(cli: &Cli, library: Vec<u8>) -> Result<()> {
        let title = format!("Intro to DirectX Raytracing | {}", cli.sample);
        let hwnd = create_window(&title, cli.width, cli.height)?;

        let mut r = RECT::default();
        unsafe { GetClientRect(hwnd, &mut r) };
        let width = (r.right - r.left).max(1) as u32;
        let height = (r.bottom - r.top).max(1) as u32;

        let device = D3d12Device::new(
            hwnd,
            width,
            height,
            DeviceOptions {
                validation: cli.validation,
                warp: cli.warp,
            },
        )?;

        let mut renderer = Renderer::new(device, cli.sample, library, width, height)?;

        unsafe { ShowWindow(hwnd, SW_SHOWNORMAL) };

        let mut last = Instant::now();
        let mut message = MSG::default();

        loop {
            if unsafe { PeekMessageW(&mut message, None, 0, 0, PM_REMOVE) }.into() {
                if message.message == WM_QUIT {
                    break;
                }
                unsafe {
                    TranslateMessage(&message);
                    DispatchMessageW(&message);
                }
                continue;
            }

            let resize = PENDING_RESIZE.lock().ok().and_then(|mut pending| pending.take());

            if let Some((width, height)) = resize {
                renderer.resize(width, height)?;
            }

            let now = Instant::now();
            let delta_time = (now - last).as_secs_f32();
            last = now;

            renderer.frame(&read_input(), delta_time)?;
        }

        renderer.flush()
    }
}

fn main() {
    let cli = Cli::from_env();

    #[cfg(windows)]
    if cli.as_ref().map_or(false, |cli| cli.console) {
        window::alloc_console();
    }

    init_logging(cli.as_ref().map_or(false, |cli| cli.validation));

    let cli = cli.or_fatal();

    cli.report_ignored();

    let headless = cli.headless || cfg!(not(windows));

    if !cli.headless && headless {
        log::warn!("Windowed mode needs Direct3D 12; running headless");
    }

    let library = load_library(&cli, headless).or_fatal();

    if headless {
        run_headless(&cli, library).or_fatal();
        return;
    }

    #[cfg(windows)]
    window::run(&cli, library).or_fatal();
}
